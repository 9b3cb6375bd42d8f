//! Server descriptors and directories: the signed records each mix server
//! publishes to advertise its keys, endpoint, validity interval, and
//! capabilities.  The wire format is a series of `[Section]` blocks of
//! `Key: value` lines.

use crate::crypto::{self, Digest};
use crate::prelude::*;
use crate::util::read_possibly_gzipped;
use time::format_description::well_known::Rfc3339;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    Relay,
    Smtp,
    Mbox,
}

impl Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Capability::Relay => "relay",
            Capability::Smtp => "smtp",
            Capability::Mbox => "mbox",
        })
    }
}

impl FromStr for Capability {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Capability> {
        match s {
            "relay" => Ok(Capability::Relay),
            "smtp" => Ok(Capability::Smtp),
            "mbox" => Ok(Capability::Mbox),
            _ => Err(bad(format!("unknown capability {:?}", s))),
        }
    }
}

/// Where packets for a server get delivered: its listening endpoint plus the
/// digest of its packet key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoutingInfo {
    pub hostname: String,
    pub port: u16,
    pub key_digest: Digest,
}

impl Display for RoutingInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    nickname: String,
    identity: Vec<u8>,
    digest: Digest,
    published: OffsetDateTime,
    valid_after: OffsetDateTime,
    valid_until: OffsetDateTime,
    capabilities: Vec<Capability>,
    routing: RoutingInfo,
    raw: String,
}

impl ServerDescriptor {
    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    /// Nicknames are case-insensitive; this is the canonical lookup form.
    pub fn lc_nickname(&self) -> String {
        self.nickname.to_lowercase()
    }

    pub fn identity(&self) -> &[u8] {
        &self.identity
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn published(&self) -> OffsetDateTime {
        self.published
    }

    pub fn valid_after(&self) -> OffsetDateTime {
        self.valid_after
    }

    pub fn valid_until(&self) -> OffsetDateTime {
        self.valid_until
    }

    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    pub fn has_capability(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }

    pub fn routing(&self) -> &RoutingInfo {
        &self.routing
    }

    /// The canonical text this descriptor was parsed from.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn same_identity(&self, other: &ServerDescriptor) -> bool {
        self.identity == other.identity
    }

    /// True if the descriptor is valid at every instant of [start, end].
    pub fn is_valid_over(&self, start: OffsetDateTime, end: OffsetDateTime) -> bool {
        self.valid_after <= start && end <= self.valid_until
    }

    pub fn is_expired_at(&self, t: OffsetDateTime) -> bool {
        self.valid_until < t
    }

    pub fn is_newer_than(&self, other: &ServerDescriptor) -> bool {
        self.published > other.published
    }

    /// True if later-published descriptors for the same nickname jointly
    /// cover this one's entire validity interval, making it obsolete.
    pub fn is_superseded_by<'a>(
        &self,
        others: impl IntoIterator<Item = &'a ServerDescriptor>,
    ) -> bool {
        let lc = self.lc_nickname();
        let mut intervals: Vec<(OffsetDateTime, OffsetDateTime)> = others
            .into_iter()
            .filter(|o| o.lc_nickname() == lc && o.published > self.published)
            .map(|o| (o.valid_after, o.valid_until))
            .collect();
        if intervals.is_empty() {
            return false;
        }
        intervals.sort();
        let mut covered_to = self.valid_after;
        for (va, vu) in intervals {
            if va > covered_to {
                return false;
            }
            if vu > covered_to {
                covered_to = vu;
            }
            if covered_to >= self.valid_until {
                return true;
            }
        }
        false
    }
}

fn bad(msg: impl Into<String>) -> eyre::Report {
    MixError::BadDescriptor(msg.into()).into()
}

peg::parser! {
    grammar block_parser() for str {
        rule line_ending()
            = quiet!{"\n"} / expected!("end of line")

        rule name_char()
            = ['A'..='Z' | 'a'..='z' | '0'..='9' | '-']

        rule header() -> &'input str
            = "[" n:$(name_char()+) "]" { n }

        // values run to the end of the line; surrounding whitespace is noise
        rule field() -> (String, String)
            = n:$(name_char()+) ":" [' ' | '\t']* v:$([^ '\n']*)
              { (n.to_owned(), v.trim_end().to_owned()) }

        pub rule block() -> (String, Vec<(String, String)>)
            = h:header() line_ending() f:(field() ** line_ending()) line_ending()? ![_]
              { (h.to_owned(), f) }
    }
}

struct Fields(HashMap<String, String>);

impl Fields {
    fn from_pairs(pairs: Vec<(String, String)>) -> Result<Fields> {
        let mut map = HashMap::new();
        for (name, value) in pairs {
            if map.insert(name.clone(), value).is_some() {
                return Err(bad(format!("duplicate field {}", name)));
            }
        }
        Ok(Fields(map))
    }

    fn get(&self, name: &str) -> Result<&str> {
        self.0
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| bad(format!("missing field {}", name)))
    }
}

fn parse_date(fields: &Fields, name: &str) -> Result<OffsetDateTime> {
    let value = fields.get(name)?;
    OffsetDateTime::parse(value, &Rfc3339)
        .map_err(|e| bad(format!("bad {} timestamp {:?}: {}", name, value, e)))
}

fn valid_nickname(nickname: &str) -> bool {
    !nickname.is_empty()
        && nickname
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Normalize a block so digests are stable however the file was shipped:
/// strip CRs and trailing junk, end with exactly one newline.
fn canonicalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 1);
    for line in text.replace('\r', "").lines() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

fn parse_block(text: &str) -> Result<(String, Fields)> {
    let (name, pairs) =
        block_parser::block(text).map_err(|e| bad(format!("{}", e)))?;
    Ok((name, Fields::from_pairs(pairs)?))
}

/// Parse one `[Server]` block.  `text` must already be canonical; the
/// descriptor's digest is the SHA-1 of exactly that text.
fn parse_server_block(text: &str) -> Result<ServerDescriptor> {
    let (name, fields) = parse_block(text)?;
    if name != "Server" {
        return Err(bad(format!("expected a [Server] block, found [{}]", name)));
    }

    let nickname = fields.get("Nickname")?.to_owned();
    if !valid_nickname(&nickname) {
        return Err(bad(format!("invalid nickname {:?}", nickname)));
    }

    let identity = data_encoding::BASE64
        .decode(fields.get("Identity")?.as_bytes())
        .map_err(|e| bad(format!("bad identity key encoding: {}", e)))?;
    if identity.is_empty() {
        return Err(bad("empty identity key"));
    }

    let published = parse_date(&fields, "Published")?;
    let valid_after = parse_date(&fields, "Valid-After")?;
    let valid_until = parse_date(&fields, "Valid-Until")?;
    if valid_until <= valid_after {
        return Err(bad("descriptor validity interval is empty"));
    }

    let mut capabilities = Vec::new();
    for word in fields.get("Capabilities")?.split_whitespace() {
        let cap: Capability = word.parse()?;
        if !capabilities.contains(&cap) {
            capabilities.push(cap);
        }
    }

    let hostname = fields.get("Hostname")?.to_owned();
    if hostname.is_empty() {
        return Err(bad("empty hostname"));
    }
    let port: u16 = fields
        .get("Port")?
        .parse()
        .map_err(|e| bad(format!("bad port: {}", e)))?;

    let key_digest_bytes = data_encoding::HEXUPPER
        .decode(fields.get("Key-Digest")?.as_bytes())
        .map_err(|e| bad(format!("bad key digest: {}", e)))?;
    let key_digest: Digest = key_digest_bytes
        .as_slice()
        .try_into()
        .map_err(|_| bad("key digest has the wrong length"))?;

    Ok(ServerDescriptor {
        nickname,
        identity,
        digest: crypto::sha1(&[text.as_bytes()]),
        published,
        valid_after,
        valid_until,
        capabilities,
        routing: RoutingInfo {
            hostname,
            port,
            key_digest,
        },
        raw: text.to_owned(),
    })
}

/// Parse a standalone descriptor (one `[Server]` block).
pub fn parse_descriptor(text: &str) -> Result<ServerDescriptor> {
    let blocks = split_blocks(text)?;
    match blocks.as_slice() {
        [one] => parse_server_block(one),
        _ => Err(bad(format!(
            "expected exactly one [Server] block, found {}",
            blocks.len()
        ))),
    }
}

/// Parse a descriptor from a file, transparently ungzipping.
pub fn parse_descriptor_file(path: &Path) -> Result<ServerDescriptor> {
    let raw = read_possibly_gzipped(path)?;
    let text = String::from_utf8(raw)
        .map_err(|_| bad(format!("{} is not valid utf-8", path.display())))?;
    parse_descriptor(&text)
        .wrap_err_with(|| format!("in descriptor file {}", path.display()))
}

pub struct ParsedDirectory {
    pub signer_identity: Vec<u8>,
    pub servers: Vec<ServerDescriptor>,
}

/// Parse a full server directory: a `[Directory]` header, a `[Signature]`
/// block naming the signing identity, then any number of `[Server]` blocks.
/// Unlike individual imports, any malformed piece invalidates the whole
/// directory.
pub fn parse_directory(text: &str) -> Result<ParsedDirectory> {
    let blocks = split_blocks(text)?;
    if blocks.len() < 2 {
        return Err(bad("directory is missing its header blocks"));
    }

    let (name, header) = parse_block(&blocks[0])?;
    if name != "Directory" {
        return Err(bad("directory must start with a [Directory] block"));
    }
    let version = header.get("Version")?;
    if version != "0.1" {
        return Err(bad(format!("unsupported directory version {:?}", version)));
    }

    let (name, signature) = parse_block(&blocks[1])?;
    if name != "Signature" {
        return Err(bad("directory is missing its [Signature] block"));
    }
    let signer_identity = data_encoding::BASE64
        .decode(signature.get("Directory-Identity")?.as_bytes())
        .map_err(|e| bad(format!("bad directory identity encoding: {}", e)))?;

    let mut servers = Vec::new();
    for block in &blocks[2..] {
        servers.push(parse_server_block(block)?);
    }
    Ok(ParsedDirectory {
        signer_identity,
        servers,
    })
}

/// Split a file into canonicalized `[Section]` blocks.
fn split_blocks(text: &str) -> Result<Vec<String>> {
    let text = text.replace('\r', "");
    let mut blocks: Vec<String> = Vec::new();
    let mut current: Option<String> = None;
    for line in text.lines() {
        if line.starts_with('[') {
            if let Some(done) = current.take() {
                blocks.push(canonicalize(&done));
            }
            current = Some(String::new());
        } else if current.is_none() && !line.trim().is_empty() {
            return Err(bad("junk before first section header"));
        }
        if let Some(block) = current.as_mut() {
            block.push_str(line);
            block.push('\n');
        }
    }
    match current {
        Some(done) => blocks.push(canonicalize(&done)),
        None => return Err(bad("no section headers found")),
    }
    Ok(blocks)
}
