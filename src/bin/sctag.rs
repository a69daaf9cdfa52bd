use std::process::ExitCode;
use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use log::{error, info};

use sctag::cli::Cli;
use sctag::pipeline;

fn main() -> ExitCode {
    let started = Instant::now();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run(Cli::parse()) {
        Ok(()) => {
            info!("done, elapsed time(s): {:.2}", started.elapsed().as_secs_f64());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Error: {e:?}");
            eprintln!("Error: {e:?}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = cli.into_config()?;
    info!(
        "INPUT={:?} OUTPUT={} SUMMARY={} ANNOTATION_FILE={} SAVE_LOW_QUALITY={} \
         SAVE_DUPLICATE={} ANNOTATION_MODE={:?} UMI_ON={} UMI_MIN_NUM={} UMI_MISMATCH={} \
         SAT_FILE={:?} FILTER_MATRIX={} CPU_CORES={} SCRNA={}",
        config.input_bams,
        config.output_bam.display(),
        config.metrics_file.display(),
        config.annotation_file.display(),
        config.save_lq,
        config.save_dup,
        config.anno_version,
        config.umi.on,
        config.umi.min_num,
        config.umi.mismatch,
        config.sat_file,
        config.filter_matrix,
        config.cpu_cores,
        config.scrna
    );
    pipeline::run(config)
}
