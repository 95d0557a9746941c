//! The one opaque operation the rest of the system is built around: driving
//! an actual upload through a leased browser session. Building the browser
//! automation itself is out of scope; this crate only defines the seam
//! (`UploadPerformer`) and calls it with a deadline, mirroring the way the
//! teacher's `JobProcessor` trait (`riptide_workers::worker::JobProcessor`)
//! separates "how a worker dispatches work" from "what the work actually
//! does".

use async_trait::async_trait;
use matrix_browser::SessionLease;
use matrix_events::{ProgressUpdate, UploadStage};
use matrix_types::error::MatrixError;
use matrix_types::video::VideoSpec;

/// Callback a [`UploadPerformer`] uses to report coarse progress as it
/// drives the upload (spec §4.6 step 5: "percent-complete, coarse stage
/// labels").
pub trait ProgressReporter: Send + Sync {
    fn report(&self, stage: UploadStage, percent: u8);
}

pub struct NoopProgressReporter;

impl ProgressReporter for NoopProgressReporter {
    fn report(&self, _stage: UploadStage, _percent: u8) {}
}

/// Implemented once per target video platform; this crate ships none of
/// its own.
#[async_trait]
pub trait UploadPerformer: Send + Sync {
    async fn perform_upload(
        &self,
        session: &SessionLease,
        video: &VideoSpec,
        progress: &dyn ProgressReporter,
    ) -> Result<String, MatrixError>;

    /// Fast probe confirming the session is still authenticated (spec §4.6
    /// step 4: "verify the session is logged in").
    async fn verify_logged_in(&self, session: &SessionLease) -> Result<bool, MatrixError>;
}

pub(crate) fn make_progress_update(job_id: uuid::Uuid, stage: UploadStage) -> ProgressUpdate {
    ProgressUpdate {
        job_id,
        percent: matrix_events::stage_percent(stage),
        stage,
        at: chrono::Utc::now(),
    }
}
