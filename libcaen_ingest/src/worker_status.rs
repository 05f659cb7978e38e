/// Progress message sent from the worker to whatever is driving the UI
#[derive(Debug, Clone, Default)]
pub struct WorkerStatus {
    pub progress: f32,
    pub files_done: usize,
    pub files_total: usize,
    pub current_file: String,
}

impl WorkerStatus {
    pub fn new(files_done: usize, files_total: usize, current_file: &str) -> Self {
        let progress = if files_total == 0 {
            1.0
        } else {
            files_done as f32 / files_total as f32
        };
        Self {
            progress,
            files_done,
            files_total,
            current_file: current_file.to_string(),
        }
    }
}
