//! Application state.

use buildfarm_scheduler::{Admin, ReportRouter};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub admin: Admin,
    pub reports: ReportRouter,
}

impl AppState {
    pub fn new(admin: Admin, reports: ReportRouter) -> Self {
        Self { admin, reports }
    }
}
