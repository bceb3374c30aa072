use uuid::Uuid;

pub type Program = String;
pub type Args = Vec<String>;
pub type JobId = Uuid;
pub type Identity = String;
pub type OutputBlob = bytes::Bytes;
