use crate::error::ControllerError;

/// Process-level return codes handed to the supervising harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    OtherFail = -2,
    InitializeFail = -1,
    Success = 0,
    BadAlloc = 1,
    DatabaseDirty = 2,
    FixedReversible = 3,
    ExtractedGenesis = 4,
    NodeManagementSuccess = 5,
}

impl ExitCode {
    pub const fn code(self) -> i32 {
        self as i32
    }
}

impl From<&ControllerError> for ExitCode {
    fn from(err: &ControllerError) -> Self {
        match err {
            ControllerError::DatabaseExhausted => Self::BadAlloc,
            ControllerError::DatabaseDirty => Self::DatabaseDirty,
            _ => Self::OtherFail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discriminants_are_stable() {
        assert_eq!(ExitCode::OtherFail.code(), -2);
        assert_eq!(ExitCode::InitializeFail.code(), -1);
        assert_eq!(ExitCode::Success.code(), 0);
        assert_eq!(ExitCode::BadAlloc.code(), 1);
        assert_eq!(ExitCode::DatabaseDirty.code(), 2);
        assert_eq!(ExitCode::FixedReversible.code(), 3);
        assert_eq!(ExitCode::ExtractedGenesis.code(), 4);
        assert_eq!(ExitCode::NodeManagementSuccess.code(), 5);
    }

    #[test]
    fn fatal_controller_errors_map_to_harness_codes() {
        assert_eq!(ExitCode::from(&ControllerError::DatabaseExhausted), ExitCode::BadAlloc);
        assert_eq!(ExitCode::from(&ControllerError::DatabaseDirty), ExitCode::DatabaseDirty);
        assert_eq!(ExitCode::from(&ControllerError::Guard), ExitCode::OtherFail);
    }
}
