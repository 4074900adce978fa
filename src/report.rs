//! Response body returned to whoever triggered a run or a manual dispatch.

use crate::dispatch::DispatchError;
use crate::scheduler::{PostRunOutcome, PostRunStatus, SchedulerReport};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub partial: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum TriggerResponse {
    /// The run completed. `success` is false when any post failed.
    Completed {
        success: bool,
        summary: RunSummary,
        outcomes: Vec<PostRunOutcome>,
    },
    /// The run or request could not be carried out.
    Rejected {
        success: bool,
        error: String,
        #[serde(skip)]
        status: u16,
    },
}

impl TriggerResponse {
    pub fn from_report(report: SchedulerReport) -> Self {
        TriggerResponse::Completed {
            success: report.failed == 0,
            summary: RunSummary {
                total: report.processed,
                successful: report.successful,
                failed: report.failed,
                partial: report.partial,
            },
            outcomes: report.outcomes,
        }
    }

    pub fn from_post(outcome: PostRunOutcome) -> Self {
        let published = outcome.is_published();
        TriggerResponse::Completed {
            success: published,
            summary: RunSummary {
                total: 1,
                successful: published as usize,
                failed: (!published) as usize,
                partial: (outcome.status == PostRunStatus::Partial) as usize,
            },
            outcomes: vec![outcome],
        }
    }

    pub fn from_dispatch_error(err: &DispatchError) -> Self {
        let status = match err {
            DispatchError::UnknownPlatform(_) => 400,
            DispatchError::PostNotFound(_) => 404,
            DispatchError::NoPlatforms { .. } => 422,
            DispatchError::Store(_) => 500,
        };
        TriggerResponse::Rejected {
            success: false,
            error: err.to_string(),
            status,
        }
    }

    pub fn fatal(error: impl Into<String>) -> Self {
        TriggerResponse::Rejected {
            success: false,
            error: error.into(),
            status: 500,
        }
    }

    /// 200 whenever the run completed, even with failed posts.
    pub fn http_status(&self) -> u16 {
        match self {
            TriggerResponse::Completed { .. } => 200,
            TriggerResponse::Rejected { status, .. } => *status,
        }
    }

    pub fn is_success(&self) -> bool {
        match self {
            TriggerResponse::Completed { success, .. } | TriggerResponse::Rejected { success, .. } => {
                *success
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
