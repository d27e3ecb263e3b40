use std::time::Duration;

/// Outcome of a failed job, as seen by whatever dispatches it.
///
/// `Nack` asks for the same work item to be rescheduled, `Fail` drops it.
#[derive(Debug)]
pub enum JobError<E> {
    Nack { error: E, delay: Option<Duration> },
    Fail(E),
}

impl<E> JobError<E> {
    pub fn error(&self) -> &E {
        match self {
            JobError::Nack { error, .. } => error,
            JobError::Fail(error) => error,
        }
    }

    pub fn into_error(self) -> E {
        match self {
            JobError::Nack { error, .. } => error,
            JobError::Fail(error) => error,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Nack { .. })
    }
}

pub type JobResult<T, E> = Result<T, JobError<E>>;

pub trait ToJobError<E> {
    fn nack(self, delay: Option<Duration>) -> JobError<E>;
    fn fail(self) -> JobError<E>;
}

impl<E> ToJobError<E> for E {
    fn nack(self, delay: Option<Duration>) -> JobError<E> {
        JobError::Nack { error: self, delay }
    }

    fn fail(self) -> JobError<E> {
        JobError::Fail(self)
    }
}
