pub use std::collections::{HashMap, HashSet};
pub use std::fmt::Display;
pub use std::io::{Read, Write};
pub use std::path::{Path, PathBuf};
pub use std::str::FromStr;

pub use eyre::{bail, eyre, Result, WrapErr};
pub use once_cell::sync::Lazy;
pub use regex::Regex;
pub use serde::{Deserialize, Serialize};
pub use time::OffsetDateTime;
pub use tracing::{debug, error, info, trace, warn};

pub use crate::context;
pub use crate::error::MixError;
pub use crate::util::slurp;
