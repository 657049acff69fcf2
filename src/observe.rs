#[derive(Clone, Debug, PartialEq)]
pub struct ProgressEvent {
    pub fraction: f64,
    pub identifier: String,
}

impl ProgressEvent {
    pub fn new(fraction: f64, identifier: impl Into<String>) -> Self {
        Self {
            fraction: fraction.clamp(0.0, 1.0),
            identifier: identifier.into(),
        }
    }
}

pub trait UploadObserver: Send + Sync {
    fn on_upload_progress(&self, _event: &ProgressEvent) {}

    fn on_upload_failed(&self, _identifier: &str, _message: &str) {}
}

pub trait DownloadObserver: Send + Sync {
    fn on_download_progress(&self, _event: &ProgressEvent) {}

    fn on_download_failed(&self, _file_name: &str, _message: &str) {}
}
