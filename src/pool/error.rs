use crate::amqp::BrokerError;
use deadpool::managed::PoolError;

/// Pool error.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The pool has been shut down and does not lend resources anymore.
    #[error("The pool has been shut down")]
    Closed,
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<PoolError<Error>> for Error {
    fn from(err: PoolError<Error>) -> Self {
        match err {
            PoolError::Backend(e) => e,
            PoolError::Closed => Self::Closed,
            err => Self::Other(anyhow::anyhow!("{err}")),
        }
    }
}
