use std::{
    io::Read,
    time::Duration,
};

use rkyv::{
    from_bytes, ser::serializers::AllocSerializer, to_bytes, AlignedVec, Archive,
    Deserialize, Serialize,
};

use super::{channel::MAX_MESSAGE_LEN, digest::ModelDigest, error::Error};

/// zstd level used for result payloads.
const COMPRESSION_LEVEL: i32 = 3;

/// Every message starts with one tag byte followed by the command-specific
/// payload. Payloads are rkyv archives; the payload of `Result` is
/// additionally zstd-compressed.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    // MASTER -> WORKER
    /// Health check
    Ping = 0x01,
    /// A model upload to install before any batch runs
    Init = 0x02,
    /// A batch of encoded tasks
    Task = 0x03,
    /// Unload a model and end the connection
    CloseConnection = 0x04,

    // WORKER -> MASTER
    /// Health check reply
    Pong = 0x81,
    /// Outcome of a model upload
    InitAck = 0x82,
    /// The trajectories of a batch, in batch order
    Result = 0x83,
    /// The connection is about to be closed by the worker
    Closed = 0x84,
    /// A task of the batch failed; the connection stays usable
    TaskFailed = 0x85,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x01 => MessageType::Ping,
            0x02 => MessageType::Init,
            0x03 => MessageType::Task,
            0x04 => MessageType::CloseConnection,
            0x81 => MessageType::Pong,
            0x82 => MessageType::InitAck,
            0x83 => MessageType::Result,
            0x84 => MessageType::Closed,
            0x85 => MessageType::TaskFailed,
            other => Err(Error::UnknownMessageType(other))?,
        })
    }
}

/// A model shipped to a worker: its id, the bytes the worker's resolver
/// turns into a runnable model, and the digest of those bytes.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct ModelUpload {
    pub model_id: String,
    pub bytecode: Vec<u8>,
    pub digest: [u8; 32],
}

impl ModelUpload {
    pub fn new(model_id: impl Into<String>, bytecode: Vec<u8>) -> Self {
        let digest = ModelDigest::of(&bytecode).0;
        Self {
            model_id: model_id.into(),
            bytecode,
            digest,
        }
    }

    pub fn digest(&self) -> ModelDigest {
        ModelDigest(self.digest)
    }

    /// Whether the bytecode still matches the digest it was sent with.
    pub fn verify(&self) -> bool {
        self.digest().matches(&self.bytecode)
    }
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub enum InitStatus {
    Installed,
    Failed(String),
}

/// An ordered batch of encoded tasks for one worker.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct NetworkTask {
    pub model_id: String,
    pub tasks: Vec<Vec<u8>>,
}

/// The outcome of one remotely executed task.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct TrajectoryRecord {
    pub payload: Vec<u8>,
    pub elapsed_nanos: u64,
    pub reached_goal: bool,
}

impl TrajectoryRecord {
    pub fn new(payload: Vec<u8>, elapsed: Duration, reached_goal: bool) -> Self {
        Self {
            payload,
            elapsed_nanos: u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX),
            reached_goal,
        }
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_nanos)
    }
}

/// The reply to a [`NetworkTask`]: one record per task, in task order.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[archive(check_bytes)]
pub struct ComputationResult {
    pub trajectories: Vec<TrajectoryRecord>,
}

/// The reply to a [`NetworkTask`] one of whose tasks returned an error.
/// The other records of the batch are not sent.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct TaskFailure {
    /// Position of the failed task in the batch.
    pub index: u32,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Ping,
    Init(ModelUpload),
    Task(NetworkTask),
    CloseConnection(String),
    Pong,
    InitAck(InitStatus),
    Result(ComputationResult),
    Closed,
    TaskFailed(TaskFailure),
}

impl Message {
    pub fn msg_type(&self) -> MessageType {
        match self {
            Message::Ping => MessageType::Ping,
            Message::Init(_) => MessageType::Init,
            Message::Task(_) => MessageType::Task,
            Message::CloseConnection(_) => MessageType::CloseConnection,
            Message::Pong => MessageType::Pong,
            Message::InitAck(_) => MessageType::InitAck,
            Message::Result(_) => MessageType::Result,
            Message::Closed => MessageType::Closed,
            Message::TaskFailed(_) => MessageType::TaskFailed,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let mut buf = vec![self.msg_type() as u8];
        match self {
            Message::Ping | Message::Pong | Message::Closed => {}
            Message::Init(upload) => buf.extend_from_slice(&archive(upload)?),
            Message::Task(batch) => buf.extend_from_slice(&archive(batch)?),
            Message::CloseConnection(model_id) => {
                buf.extend_from_slice(&archive(model_id)?)
            }
            Message::InitAck(status) => buf.extend_from_slice(&archive(status)?),
            Message::TaskFailed(failure) => buf.extend_from_slice(&archive(failure)?),
            Message::Result(result) => {
                let archived = archive(result)?;
                let compressed = zstd::encode_all(&archived[..], COMPRESSION_LEVEL)
                    .map_err(Error::Compression)?;
                buf.extend_from_slice(&compressed);
            }
        }
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let (&tag, payload) = buf.split_first().ok_or(Error::EmptyMessage)?;
        Ok(match MessageType::try_from(tag)? {
            MessageType::Ping => Message::Ping,
            MessageType::Pong => Message::Pong,
            MessageType::Closed => Message::Closed,
            MessageType::Init => Message::Init(
                from_bytes::<ModelUpload>(&aligned(payload))
                    .map_err(|_| Error::CouldNotDecodeMessage)?,
            ),
            MessageType::Task => Message::Task(
                from_bytes::<NetworkTask>(&aligned(payload))
                    .map_err(|_| Error::CouldNotDecodeMessage)?,
            ),
            MessageType::CloseConnection => Message::CloseConnection(
                from_bytes::<String>(&aligned(payload))
                    .map_err(|_| Error::CouldNotDecodeMessage)?,
            ),
            MessageType::InitAck => Message::InitAck(
                from_bytes::<InitStatus>(&aligned(payload))
                    .map_err(|_| Error::CouldNotDecodeMessage)?,
            ),
            MessageType::TaskFailed => Message::TaskFailed(
                from_bytes::<TaskFailure>(&aligned(payload))
                    .map_err(|_| Error::CouldNotDecodeMessage)?,
            ),
            MessageType::Result => {
                let archived = decompress(payload, MAX_MESSAGE_LEN)?;
                Message::Result(
                    from_bytes::<ComputationResult>(&aligned(&archived))
                        .map_err(|_| Error::CouldNotDecodeMessage)?,
                )
            }
        })
    }
}

fn archive<T>(value: &T) -> Result<AlignedVec, Error>
where
    T: Serialize<AllocSerializer<1024>>,
{
    to_bytes::<_, 1024>(value).map_err(|_| Error::CouldNotEncodeMessage)
}

/// Inflates a zstd payload, refusing to produce more than `limit` bytes.
fn decompress(payload: &[u8], limit: usize) -> Result<Vec<u8>, Error> {
    let decoder = zstd::stream::Decoder::new(payload).map_err(Error::Compression)?;
    let mut out = Vec::new();
    decoder
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(Error::Compression)?;
    if out.len() > limit {
        Err(Error::MessageLengthOverflowed(out.len()))?
    }
    Ok(out)
}

// archives are validated in place, which needs the alignment the tag byte
// and the framing take away
fn aligned(payload: &[u8]) -> AlignedVec {
    let mut buf = AlignedVec::with_capacity(payload.len());
    buf.extend_from_slice(payload);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_messages_are_a_single_tag_byte() {
        assert_eq!(Message::Ping.encode().unwrap(), vec![0x01]);
        assert_eq!(Message::decode(&[0x81]).unwrap(), Message::Pong);
        assert_eq!(Message::decode(&[0x84]).unwrap(), Message::Closed);
    }

    #[test]
    fn result_keeps_batch_order() {
        let result = ComputationResult {
            trajectories: (0..5u8)
                .map(|i| {
                    TrajectoryRecord::new(vec![i; 64], Duration::from_micros(i as u64), i % 2 == 0)
                })
                .collect(),
        };
        let buf = Message::Result(result.clone()).encode().unwrap();
        match Message::decode(&buf).unwrap() {
            Message::Result(decoded) => {
                assert_eq!(decoded.trajectories.len(), 5);
                assert_eq!(decoded, result);
                assert_eq!(decoded.trajectories[3].payload, vec![3; 64]);
            }
            other => panic!("expected a result, got {:?}", other.msg_type()),
        }
    }

    #[test]
    fn result_payload_is_compressed() {
        let result = ComputationResult {
            trajectories: vec![TrajectoryRecord::new(vec![0; 4096], Duration::ZERO, false)],
        };
        let buf = Message::Result(result).encode().unwrap();
        assert!(buf.len() < 1024);
    }

    #[test]
    fn decompression_stops_at_the_limit() {
        let bomb = zstd::encode_all(&[0u8; 64 * 1024][..], COMPRESSION_LEVEL).unwrap();
        assert!(bomb.len() < 1024);
        assert!(matches!(
            decompress(&bomb, 4096),
            Err(Error::MessageLengthOverflowed(4097))
        ));
        assert_eq!(decompress(&bomb, 64 * 1024).unwrap().len(), 64 * 1024);
        assert!(matches!(
            decompress(b"not zstd", 4096),
            Err(Error::Compression(_))
        ));
    }

    #[test]
    fn upload_digest_survives_the_wire() {
        let upload = ModelUpload::new("walk", b"params".to_vec());
        let buf = Message::Init(upload.clone()).encode().unwrap();
        match Message::decode(&buf).unwrap() {
            Message::Init(decoded) => {
                assert!(decoded.verify());
                assert_eq!(decoded.digest(), upload.digest());
            }
            other => panic!("expected an init, got {:?}", other.msg_type()),
        }
    }

    #[test]
    fn tampered_upload_fails_verification() {
        let mut upload = ModelUpload::new("walk", b"params".to_vec());
        upload.bytecode.push(0);
        assert!(!upload.verify());
    }

    #[test]
    fn rejects_unknown_and_malformed_messages() {
        assert!(matches!(
            Message::decode(&[0x7f]),
            Err(Error::UnknownMessageType(0x7f))
        ));
        assert!(matches!(Message::decode(&[]), Err(Error::EmptyMessage)));
        assert!(matches!(
            Message::decode(&[0x03, 1, 2, 3]),
            Err(Error::CouldNotDecodeMessage)
        ));
    }
}
