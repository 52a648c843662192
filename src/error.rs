use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("amqp: {0}")]
    Amqp(#[from] lapin::Error),
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("gave up connecting to broker after {attempts} attempts: {last}")]
    ConnectExhausted {
        attempts: u32,
        #[source]
        last: Box<BrokerError>,
    },
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] simd_json::Error),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("missing device_id")]
    MissingDeviceId,
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive database: {0}")]
    Database(#[from] sqlx::Error),
    #[error("archive rejected batch: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink {sink} full; send timed out")]
    Full { sink: String },
    #[error("sink {sink} closed")]
    Closed { sink: String },
}
