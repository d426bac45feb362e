use anyhow::Result;

use super::args::ListCliArgs;
use super::truncate;
use crate::db::{Database, JobRepository};

pub fn handle_jobs_command(args: ListCliArgs) -> Result<()> {
    let db = Database::open_default()?;
    let jobs = JobRepository::list(&*db.conn()?, args.limit)?;

    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!("Found {} job(s):\n", jobs.len());

    for job in jobs {
        println!("ID: {}", job.id);
        println!("Input: {}", job.input.display());
        println!("Status: {} ({}%)", job.status, job.progress);
        println!("Created: {}", job.created_at.format("%Y-%m-%d %H:%M:%S"));
        if job.retry_count > 0 {
            println!("Retries: {}", job.retry_count);
        }
        if let Some(output) = &job.output {
            println!("Output: {}", output.display());
        }
        if let Some(error) = &job.error {
            println!("Error: {}", truncate(error, 100));
        }
        println!("---");
    }

    Ok(())
}
