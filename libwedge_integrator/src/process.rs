use std::sync::mpsc::Sender;

use super::config::Config;
use super::error::ProcessorError;
use super::finalize::FinalizationPipeline;
use super::integration::Integrator;
use super::results::{ResultRecord, ResultStatus};
use super::run_spec::RunSpecification;
use super::tool::{CancelToken, Tools};
use super::wedge_scheduler::{final_dir, ThreadWedgeRunner, WedgeScheduler};
use super::worker_status::{StatusSender, WorkerStage, WorkerStatus};

/// The main loop of a dataset worker.
///
/// Follows the collection described by the config, integrates it and produces
/// the deliverables. Every failure ends as a Failed record written to the work
/// directory; an Err is returned only when even that could not be done.
pub fn process_dataset(
    config: &Config,
    tx: &Sender<WorkerStatus>,
    worker_id: &usize,
) -> Result<ResultRecord, ProcessorError> {
    process_dataset_with(
        config,
        Tools::from_config(config),
        &CancelToken::new(),
        tx,
        worker_id,
    )
}

/// Like process_dataset, with the programs to run supplied by the caller.
/// Cancelling the token stops the final pass and the finalization tools.
pub fn process_dataset_with(
    config: &Config,
    tools: Tools,
    cancel: &CancelToken,
    tx: &Sender<WorkerStatus>,
    worker_id: &usize,
) -> Result<ResultRecord, ProcessorError> {
    let status = StatusSender::new(tx, &config.results_name(), *worker_id);
    status.send(0.0, WorkerStage::Waiting)?;

    let record = match integrate_dataset(config, tools, cancel, &status) {
        Ok(record) => record,
        Err(e) => {
            log::error!("Dataset {} failed: {e}", config.results_name());
            let record = ResultRecord::failed(requested_range(config), &e.to_string());
            std::fs::create_dir_all(&config.work_directory)?;
            record.write(&config.work_directory)?;
            record
        }
    };

    if record.is_success() {
        log::info!("Dataset {} is complete", config.results_name());
        status.send(1.0, WorkerStage::Done)?;
    } else {
        status.send(1.0, WorkerStage::Failed)?;
    }
    Ok(record)
}

fn integrate_dataset(
    config: &Config,
    tools: Tools,
    cancel: &CancelToken,
    status: &StatusSender,
) -> Result<ResultRecord, ProcessorError> {
    config.validate()?;
    let run_spec = RunSpecification::from_config(config)?;
    std::fs::create_dir_all(&config.work_directory)?;
    log::info!(
        "Processing {} ({:?}) in {}",
        config.results_name(),
        config.command,
        config.work_directory.to_string_lossy()
    );

    let integrator = Integrator::from_config(config, &run_spec, tools.clone())?;
    let runner =
        ThreadWedgeRunner::new(integrator, &config.work_directory).with_cancel(cancel.clone());
    let mut scheduler = WedgeScheduler::from_config(config, run_spec.clone(), runner)
        .with_status(status.clone());
    let outcome = scheduler.run()?;
    log::info!(
        "{} wedges integrated before the final pass",
        scheduler.runner().wedges_done()
    );
    if outcome.collection_aborted {
        log::warn!(
            "Collection ended early; integrated images {}-{}",
            outcome.range.0,
            outcome.range.1
        );
    }

    let mut record = outcome.attempt.record;
    if record.status == ResultStatus::Failed {
        return Ok(record);
    }

    status.send(0.0, WorkerStage::Finalize)?;
    let attempt_dir = final_dir(&config.work_directory, outcome.range);
    let pipeline = FinalizationPipeline::from_config(config, tools.local.clone());
    match pipeline.finalize(&mut record, &run_spec, &attempt_dir, cancel) {
        Ok(manifest) => {
            log::info!(
                "Delivered {} files to {}",
                manifest.files.len(),
                manifest.results_dir.to_string_lossy()
            );
        }
        Err(e) => {
            log::error!("Finalization of {} failed: {e}", config.results_name());
            record.mark_failed(&e.to_string());
            if attempt_dir.exists() {
                record.write(&attempt_dir)?;
            }
            record.write(&config.work_directory)?;
        }
    }
    Ok(record)
}

fn requested_range(config: &Config) -> (u32, u32) {
    let first = config.run.start;
    (first, first + config.run.total.saturating_sub(1))
}
