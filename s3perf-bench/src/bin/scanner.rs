//! Record counter for gzip-compressed NDJSON objects.

use anyhow::Result;

fn main() -> Result<()> {
    s3perf_bench::cli::scanner()
}
