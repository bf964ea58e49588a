use crate::error::{Error, Result};

/// The lifecycle of a decode or encode session.
///
/// Sessions start `Open`. A decoder moves to `Finished` once its input is exhausted. The first
/// codec failure moves either kind of session to `Poisoned`, after which every call returns that
/// same error. `Closed` is terminal and reachable from every other state.
#[derive(Clone, Debug, Default)]
pub enum SessionState {
    #[default]
    Open,
    Finished,
    Poisoned(Error),
    Closed,
}

impl SessionState {
    /// Fails if the session can't accept another call.
    pub(crate) fn check(&self) -> Result<()> {
        match self {
            Self::Open | Self::Finished => Ok(()),
            Self::Poisoned(e) => Err(e.clone()),
            Self::Closed => Err(Error::Closed),
        }
    }

    pub(crate) fn poison(&mut self, e: &Error) {
        if matches!(self, Self::Open | Self::Finished) {
            *self = Self::Poisoned(e.clone());
        }
    }

    pub(crate) fn finish(&mut self) {
        if matches!(self, Self::Open) {
            *self = Self::Finished;
        }
    }

    /// Moves to `Closed`, returning true if the session wasn't already closed.
    pub(crate) fn close(&mut self) -> bool {
        !matches!(std::mem::replace(self, Self::Closed), Self::Closed)
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            Self::Poisoned(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_poison_is_permanent() {
        let mut state = SessionState::default();
        state.poison(&Error::Format);
        state.poison(&Error::GeneralFault);
        assert!(matches!(state.check(), Err(Error::Format)));
        assert!(matches!(state.check(), Err(Error::Format)));
        state.finish();
        assert!(matches!(state.error(), Some(Error::Format)));
    }

    #[test]
    fn test_close() {
        let mut state = SessionState::default();
        state.finish();
        assert!(state.is_finished());
        assert!(state.close());
        assert!(!state.close());
        assert!(matches!(state.check(), Err(Error::Closed)));
        state.poison(&Error::Format);
        assert!(state.is_closed());
    }
}
