use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MixError {
    // directory cache
    #[error("couldn't find a valid descriptor for {0}")]
    NoValidDescriptor(String),
    #[error("no known server or descriptor file named {0}")]
    UnknownDescriptor(String),
    #[error("identity key changed for server {0}")]
    IdentityKeyConflict(String),
    #[error("server descriptor is already imported")]
    AlreadyImported,
    #[error("server descriptor is expired")]
    DescriptorExpired,
    #[error("server descriptor is superseded")]
    DescriptorSuperseded,
    #[error("recursive error while regenerating server cache")]
    CacheCorrupt,
    #[error("couldn't download directory: {0}")]
    DirectoryDownloadFailed(String),
    #[error("downloaded directory is invalid: {0}")]
    DirectoryInvalid(String),
    #[error("bad identity key on directory")]
    DirectoryBadIdentity,

    // path selection
    #[error("no relay servers known")]
    NoRelaysKnown,
    #[error("no suitable exit servers known")]
    NoExitServers,
    #[error("server {nickname} does not support {capability}")]
    CapabilityViolation {
        nickname: String,
        capability: String,
    },
    #[error("mismatch between specified swap points")]
    SwapMismatch,
    #[error("mismatch between specified number of hops")]
    HopCountMismatch,
    #[error("invalid path: {0}")]
    BadPath(String),

    // parsing
    #[error("can't parse address: {0}")]
    BadAddress(String),
    #[error("can't parse server descriptor: {0}")]
    BadDescriptor(String),
    #[error("can't parse reply block: {0}")]
    BadReplyBlock(String),
    #[error("can't parse message: {0}")]
    BadMessage(String),

    // keyring
    #[error("invalid magic on key file")]
    BadKeyMagic,
    #[error("key file too short")]
    KeyFileTruncated,
    #[error("incorrect password")]
    WrongPassword,

    // spool
    #[error("unrecognized packet format for spool entry {0}")]
    SpoolBadFormat(String),

    // delivery
    #[error("no usable reply blocks found")]
    NoUsableSurbs,
    #[error("packet could not be delivered and queueing was disabled")]
    MessageLost,
    #[error("timed out while talking to {0}")]
    TransportTimeout(String),
    #[error("transport error: {0}")]
    Protocol(String),

    // lock
    #[error("couldn't open lock file {path}: {source}")]
    LockUnavailable {
        path: PathBuf,
        source: std::io::Error,
    },
}
