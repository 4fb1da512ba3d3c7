use std::sync::Arc;

use crate::domain::allocation::AllocationCoordinator;

/// Application dependencies
pub struct ApplicationServices {
    pub coordinator: Arc<AllocationCoordinator>,
}
