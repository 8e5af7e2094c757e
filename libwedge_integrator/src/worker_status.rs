use std::sync::mpsc::{SendError, Sender};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BarColor {
    #[default]
    CYAN,
    MAGENTA,
    RED,
    GREEN,
}

/// Where a dataset worker currently is
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WorkerStage {
    #[default]
    Waiting,
    Wedge,
    Final,
    Results,
    Finalize,
    Done,
    Failed,
}

impl WorkerStage {
    pub fn color(&self) -> BarColor {
        match self {
            Self::Waiting | Self::Wedge => BarColor::CYAN,
            Self::Final | Self::Results => BarColor::MAGENTA,
            Self::Finalize | Self::Done => BarColor::GREEN,
            Self::Failed => BarColor::RED,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Wedge => "wedge",
            Self::Final => "final",
            Self::Results => "results",
            Self::Finalize => "finalize",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WorkerStatus {
    pub progress: f32,
    pub dataset: String,
    pub worker_id: usize,
    pub stage: WorkerStage,
    pub color: BarColor,
}

impl WorkerStatus {
    pub fn new(progress: f32, dataset: &str, worker_id: usize, stage: WorkerStage) -> Self {
        Self {
            progress,
            dataset: dataset.to_string(),
            worker_id,
            stage,
            color: stage.color(),
        }
    }
}

/// Sends the status of one dataset worker to the front end
#[derive(Debug, Clone)]
pub struct StatusSender {
    tx: Sender<WorkerStatus>,
    dataset: String,
    worker_id: usize,
}

impl StatusSender {
    pub fn new(tx: &Sender<WorkerStatus>, dataset: &str, worker_id: usize) -> Self {
        Self {
            tx: tx.clone(),
            dataset: dataset.to_string(),
            worker_id,
        }
    }

    pub fn send(&self, progress: f32, stage: WorkerStage) -> Result<(), SendError<WorkerStatus>> {
        self.tx
            .send(WorkerStatus::new(progress, &self.dataset, self.worker_id, stage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sender_tags_dataset() {
        let (tx, rx) = std::sync::mpsc::channel();
        let sender = StatusSender::new(&tx, "lyso_1", 3);
        sender.send(0.5, WorkerStage::Final).unwrap();
        let status = rx.recv().unwrap();
        assert_eq!(status.dataset, "lyso_1");
        assert_eq!(status.worker_id, 3);
        assert_eq!(status.color, BarColor::MAGENTA);
    }
}
