//! Write-then-read throughput benchmark.

use anyhow::Result;

fn main() -> Result<()> {
    s3perf_bench::cli::benchmark()
}
