use crate::config::{ClientConfig, UserConfig};
use crate::descriptor::{
    parse_descriptor, Capability, RoutingInfo, ServerDescriptor,
};
use crate::directory::ClientDirectory;
use crate::keyring::PasswordPrompt;
use crate::lock::ClientLock;
use crate::packet::{build_reply_block, ReplyBlock};
use crate::prelude::*;
use crate::transport::Transport;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cell::{Cell, RefCell};
use std::time::Duration as StdDuration;
use time::format_description::well_known::Rfc3339;
use time::macros::datetime;

/// Validity window shared by most synthetic descriptors.
pub const SPAN_START: OffsetDateTime = datetime!(2026-08-01 0:00 UTC);
pub const SPAN_END: OffsetDateTime = datetime!(2026-08-31 0:00 UTC);

pub const ALL_CAPS: &[Capability] =
    &[Capability::Relay, Capability::Smtp, Capability::Mbox];

/// A stable fake public key, distinct per name.
pub fn test_identity(name: &str) -> Vec<u8> {
    format!("synthetic identity key for {}", name).into_bytes()
}

fn rfc3339(t: OffsetDateTime) -> String {
    t.format(&Rfc3339).unwrap()
}

pub fn descriptor_text(
    nickname: &str,
    identity: &[u8],
    published: OffsetDateTime,
    valid_after: OffsetDateTime,
    valid_until: OffsetDateTime,
    capabilities: &[Capability],
    port: u16,
) -> String {
    let caps: Vec<String> = capabilities.iter().map(|c| c.to_string()).collect();
    format!(
        "[Server]\n\
         Nickname: {}\n\
         Identity: {}\n\
         Published: {}\n\
         Valid-After: {}\n\
         Valid-Until: {}\n\
         Capabilities: {}\n\
         Hostname: {}.example.net\n\
         Port: {}\n\
         Key-Digest: {}\n",
        nickname,
        data_encoding::BASE64.encode(identity),
        rfc3339(published),
        rfc3339(valid_after),
        rfc3339(valid_until),
        caps.join(" "),
        nickname.to_lowercase(),
        port,
        data_encoding::HEXUPPER.encode(&crate::crypto::sha1(&[identity])),
    )
}

pub fn test_descriptor(
    nickname: &str,
    capabilities: &[Capability],
    valid_after: OffsetDateTime,
    valid_until: OffsetDateTime,
) -> ServerDescriptor {
    let text = descriptor_text(
        nickname,
        &test_identity(nickname),
        valid_after,
        valid_after,
        valid_until,
        capabilities,
        48099,
    );
    parse_descriptor(&text).unwrap()
}

pub fn test_routing(hostname: &str) -> RoutingInfo {
    RoutingInfo {
        hostname: hostname.to_owned(),
        port: 48099,
        key_digest: crate::crypto::sha1(&[hostname.as_bytes()]),
    }
}

pub fn directory_text(signer_identity: &[u8], server_blocks: &[&str]) -> String {
    let mut out = format!(
        "[Directory]\n\
         Version: 0.1\n\
         Published: {}\n\
         [Signature]\n\
         Directory-Identity: {}\n",
        rfc3339(SPAN_START),
        data_encoding::BASE64.encode(signer_identity),
    );
    for block in server_blocks {
        out.push_str(block);
    }
    out
}

pub fn test_state_dir(base: &Path) -> PathBuf {
    base.join("state")
}

/// Write a plain-text directory file into a state directory.
pub fn write_directory(state_dir: &Path, server_blocks: &[&str]) -> Result<()> {
    std::fs::create_dir_all(state_dir)?;
    let text = directory_text(&test_identity("directory-signer"), server_blocks);
    std::fs::write(state_dir.join("dir"), text)?;
    Ok(())
}

/// Open a directory cache seeded with the given servers, all valid over
/// [SPAN_START, SPAN_END].
pub fn open_pool<'a>(
    state_dir: &Path,
    lock: &'a ClientLock,
    specs: &[(&str, &[Capability])],
) -> Result<ClientDirectory<'a>> {
    let blocks: Vec<String> = specs
        .iter()
        .enumerate()
        .map(|(i, (name, caps))| {
            descriptor_text(
                name,
                &test_identity(name),
                SPAN_START,
                SPAN_START,
                SPAN_END,
                caps,
                48000 + i as u16,
            )
        })
        .collect();
    let refs: Vec<&str> = blocks.iter().map(String::as_str).collect();
    write_directory(state_dir, &refs)?;
    ClientDirectory::open(state_dir, lock, ureq::agent())
}

/// `n` all-capability relays named Relay0..Relay{n-1}.
pub fn relay_pool<'a>(
    state_dir: &Path,
    lock: &'a ClientLock,
    n: usize,
) -> Result<ClientDirectory<'a>> {
    let names: Vec<String> = (0..n).map(|i| format!("Relay{}", i)).collect();
    let specs: Vec<(&str, &[Capability])> =
        names.iter().map(|name| (name.as_str(), ALL_CAPS)).collect();
    open_pool(state_dir, lock, &specs)
}

/// A deterministic reply block; different seeds give different blocks.
pub fn test_surb(seed: u64, expiry: OffsetDateTime) -> ReplyBlock {
    let mut rng = StdRng::seed_from_u64(seed);
    let hop = test_descriptor("SurbHop", ALL_CAPS, SPAN_START, SPAN_END);
    build_reply_block(
        std::slice::from_ref(&hop),
        crate::address::MBOX_TYPE,
        b"joe",
        &[0x42; 20],
        expiry,
        &mut rng,
    )
    .unwrap()
}

pub fn test_config(userdir: &Path) -> ClientConfig {
    ClientConfig {
        user: UserConfig {
            user_dir: userdir.to_string_lossy().into_owned(),
        },
        ..Default::default()
    }
}

/// A password prompt that plays back a fixed script.
pub struct ScriptedPrompt {
    answers: Vec<String>,
    next: usize,
}

impl ScriptedPrompt {
    pub fn new(answers: &[&str]) -> ScriptedPrompt {
        ScriptedPrompt {
            answers: answers.iter().map(|s| s.to_string()).collect(),
            next: 0,
        }
    }

    pub fn exhausted(&self) -> bool {
        self.next == self.answers.len()
    }

    fn pop(&mut self) -> Result<String> {
        let answer = self
            .answers
            .get(self.next)
            .ok_or_else(|| eyre!("scripted prompt ran out of answers"))?;
        self.next += 1;
        Ok(answer.clone())
    }
}

impl PasswordPrompt for ScriptedPrompt {
    fn get_password(&mut self, _which: &str) -> Result<String> {
        self.pop()
    }

    fn get_new_password(&mut self, _which: &str) -> Result<String> {
        self.pop()
    }
}

/// A transport that records batches and can be told to fail.
pub struct MockTransport {
    fail: bool,
    attempts: Cell<usize>,
    pub sent: RefCell<Vec<(RoutingInfo, usize)>>,
}

impl MockTransport {
    pub fn working() -> MockTransport {
        MockTransport {
            fail: false,
            attempts: Cell::new(0),
            sent: RefCell::new(Vec::new()),
        }
    }

    pub fn failing() -> MockTransport {
        MockTransport {
            fail: true,
            ..MockTransport::working()
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.get()
    }
}

impl Transport for MockTransport {
    fn send_packets(
        &self,
        routing: &RoutingInfo,
        packets: &[Vec<u8>],
        _timeout: StdDuration,
    ) -> Result<()> {
        self.attempts.set(self.attempts.get() + 1);
        if self.fail {
            return Err(MixError::Protocol("mock transport failure".into()).into());
        }
        self.sent
            .borrow_mut()
            .push((routing.clone(), packets.len()));
        Ok(())
    }
}
