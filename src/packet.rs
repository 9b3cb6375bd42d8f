//! Onion packets and single-use reply blocks.
//!
//! Packets are built by layering a counter-mode cipher per hop, exit first,
//! so each server can strip exactly one layer.  A reply block carries the
//! pre-built half of that onion plus a tag; the tag and the keyring's
//! reply key together determine the payload key, so only the block's
//! creator can read what comes back.

use crate::crypto::{ctr_crypt, derive_key, sha1, Digest, DIGEST_LEN};
use crate::descriptor::{RoutingInfo, ServerDescriptor};
use crate::prelude::*;
use crate::util::format_time;
use rand::{CryptoRng, Rng, RngCore};

const PACKET_MAGIC: &[u8] = b"MIXPKT-0";
const SURB_MAGIC: &[u8] = b"SURB-0";
pub const TAG_LEN: usize = 20;

/// Fixed size of the payload section, padding included.
pub const PAYLOAD_LEN: usize = 28 * 1024;
// u32 length + digest of the compressed bytes
const FRAME_OVERHEAD: usize = 4 + DIGEST_LEN;

/// Decompression larger than this ratio is treated as a zlib bomb.
const MAX_COMPRESSION_RATIO: u64 = 20;

pub const REPLY_BLOCK_BEGIN: &str = "== BEGIN TYPE III REPLY BLOCK ==";
pub const REPLY_BLOCK_END: &str = "== END TYPE III REPLY BLOCK ==";
pub const MESSAGE_BEGIN: &str = "-----BEGIN TYPE III ANONYMOUS MESSAGE-----";
pub const MESSAGE_END: &str = "-----END TYPE III ANONYMOUS MESSAGE-----";

fn bad_surb(msg: impl Into<String>) -> eyre::Report {
    MixError::BadReplyBlock(msg.into()).into()
}

fn bad_msg(msg: impl Into<String>) -> eyre::Report {
    MixError::BadMessage(msg.into()).into()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyBlock {
    expiry: OffsetDateTime,
    first_hop: RoutingInfo,
    tag: [u8; TAG_LEN],
    header: Vec<u8>,
}

impl ReplyBlock {
    pub fn expiry(&self) -> OffsetDateTime {
        self.expiry
    }

    pub fn first_hop(&self) -> &RoutingInfo {
        &self.first_hop
    }

    pub fn tag(&self) -> &[u8; TAG_LEN] {
        &self.tag
    }

    pub fn pack(&self) -> Vec<u8> {
        let mut out = SURB_MAGIC.to_vec();
        out.extend_from_slice(&self.expiry.unix_timestamp().to_be_bytes());
        let host = self.first_hop.hostname.as_bytes();
        out.extend_from_slice(&(host.len() as u16).to_be_bytes());
        out.extend_from_slice(host);
        out.extend_from_slice(&self.first_hop.port.to_be_bytes());
        out.extend_from_slice(&self.first_hop.key_digest);
        out.extend_from_slice(&self.tag);
        out.extend_from_slice(&(self.header.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.header);
        out
    }

    fn read(r: &mut Reader<'_>) -> Result<ReplyBlock> {
        let magic = r.take(SURB_MAGIC.len())?;
        if magic != SURB_MAGIC {
            return Err(eyre!("bad magic"));
        }
        let expiry = OffsetDateTime::from_unix_timestamp(r.i64()?)
            .map_err(|e| eyre!("bad expiry: {}", e))?;
        let host_len = r.u16()? as usize;
        let hostname = String::from_utf8(r.take(host_len)?.to_vec())
            .map_err(|_| eyre!("hostname is not utf-8"))?;
        let port = r.u16()?;
        let key_digest: Digest = r
            .take(DIGEST_LEN)?
            .try_into()
            .map_err(|_| eyre!("truncated key digest"))?;
        let tag: [u8; TAG_LEN] = r
            .take(TAG_LEN)?
            .try_into()
            .map_err(|_| eyre!("truncated tag"))?;
        let header_len = r.u32()? as usize;
        let header = r.take(header_len)?.to_vec();
        Ok(ReplyBlock {
            expiry,
            first_hop: RoutingInfo {
                hostname,
                port,
                key_digest,
            },
            tag,
            header,
        })
    }

    pub fn pack_text(&self) -> String {
        let mut out = String::new();
        out.push_str(REPLY_BLOCK_BEGIN);
        out.push('\n');
        let encoded = data_encoding::BASE64.encode(&self.pack());
        for chunk in encoded.as_bytes().chunks(64) {
            // chunks of an ascii string are ascii
            out.push_str(std::str::from_utf8(chunk).unwrap_or(""));
            out.push('\n');
        }
        out.push_str(REPLY_BLOCK_END);
        out.push('\n');
        out
    }

    /// Human-readable description, for `inspect-surbs`.
    pub fn describe(&self) -> String {
        format!(
            "Reply block: first hop {}, expires {}, tag {}",
            self.first_hop,
            format_time(self.expiry),
            data_encoding::HEXLOWER.encode(&self.tag[..8]),
        )
    }
}

/// Parse a concatenation of packed reply blocks.
pub fn parse_reply_blocks(data: &[u8]) -> Result<Vec<ReplyBlock>> {
    let mut r = Reader::new(data);
    let mut blocks = Vec::new();
    while !r.is_empty() {
        blocks.push(ReplyBlock::read(&mut r).map_err(|e| bad_surb(e.to_string()))?);
    }
    if blocks.is_empty() {
        return Err(bad_surb("no reply blocks found"));
    }
    Ok(blocks)
}

/// Parse ascii-armored reply blocks.
pub fn parse_text_reply_blocks(text: &str) -> Result<Vec<ReplyBlock>> {
    let mut blocks = Vec::new();
    let mut body: Option<String> = None;
    for line in text.lines() {
        let line = line.trim();
        if line == REPLY_BLOCK_BEGIN {
            if body.is_some() {
                return Err(bad_surb("nested reply block armor"));
            }
            body = Some(String::new());
        } else if line == REPLY_BLOCK_END {
            let encoded = body
                .take()
                .ok_or_else(|| bad_surb("end marker without a beginning"))?;
            let raw = data_encoding::BASE64
                .decode(encoded.as_bytes())
                .map_err(|e| bad_surb(format!("bad base64: {}", e)))?;
            let mut r = Reader::new(&raw);
            let block =
                ReplyBlock::read(&mut r).map_err(|e| bad_surb(e.to_string()))?;
            if !r.is_empty() {
                return Err(bad_surb("trailing garbage after reply block"));
            }
            blocks.push(block);
        } else if let Some(b) = body.as_mut() {
            b.push_str(line);
        }
    }
    if body.is_some() {
        return Err(bad_surb("unterminated reply block armor"));
    }
    if blocks.is_empty() {
        return Err(bad_surb("no reply blocks found"));
    }
    Ok(blocks)
}

/// One layer of the onion: a fresh nonce, then the rest of the packet
/// enciphered under a key only this hop can derive.
fn add_layer<R: RngCore + CryptoRng>(
    body: &mut Vec<u8>,
    hop: &RoutingInfo,
    rng: &mut R,
) {
    let mut nonce = [0u8; 16];
    rng.fill_bytes(&mut nonce);
    let key = derive_key(&[b"HOP KEY", &hop.key_digest, &nonce]);
    ctr_crypt(&key, body);
    let mut layered = nonce.to_vec();
    layered.append(body);
    *body = layered;
}

fn onion<R: RngCore + CryptoRng>(
    hops: &[ServerDescriptor],
    core: Vec<u8>,
    rng: &mut R,
) -> Vec<u8> {
    let mut body = core;
    for hop in hops.iter().rev() {
        add_layer(&mut body, hop.routing(), rng);
    }
    body
}

/// Compress and frame a payload into the fixed-size payload section.
fn frame_payload<R: RngCore + CryptoRng>(
    payload: Option<&[u8]>,
    rng: &mut R,
) -> Result<Vec<u8>> {
    let compressed = match payload {
        None => Vec::new(),
        Some(data) => compress(data)?,
    };
    if compressed.len() > PAYLOAD_LEN - FRAME_OVERHEAD {
        return Err(bad_msg(format!(
            "message too long ({} bytes compressed)",
            compressed.len()
        )));
    }
    let mut out = Vec::with_capacity(PAYLOAD_LEN);
    out.extend_from_slice(&(compressed.len() as u32).to_be_bytes());
    out.extend_from_slice(&sha1(&[&compressed]));
    out.extend_from_slice(&compressed);
    let mut padding = vec![0u8; PAYLOAD_LEN - out.len()];
    rng.fill_bytes(&mut padding);
    out.append(&mut padding);
    Ok(out)
}

fn unframe_payload(block: &[u8], force: bool) -> Result<Vec<u8>> {
    if block.len() < FRAME_OVERHEAD {
        return Err(bad_msg("payload too short"));
    }
    let len = u32::from_be_bytes(
        block[..4].try_into().expect("sliced exactly four bytes"),
    ) as usize;
    let digest = &block[4..FRAME_OVERHEAD];
    let rest = &block[FRAME_OVERHEAD..];
    if len > rest.len() {
        return Err(bad_msg("payload length field out of range"));
    }
    let compressed = &rest[..len];
    if digest != sha1(&[compressed]) {
        return Err(bad_msg(
            "payload checksum mismatch; wrong key or corrupted message",
        ));
    }
    if compressed.is_empty() {
        return Ok(Vec::new());
    }
    decompress(compressed, force)
}

fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut enc =
        flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(data)?;
    Ok(enc.finish()?)
}

fn decompress(data: &[u8], force: bool) -> Result<Vec<u8>> {
    let limit = (data.len() as u64)
        .saturating_mul(MAX_COMPRESSION_RATIO)
        .max(1024);
    let mut out = Vec::new();
    if force {
        flate2::read::ZlibDecoder::new(data).read_to_end(&mut out)?;
        return Ok(out);
    }
    let mut dec = flate2::read::ZlibDecoder::new(data).take(limit + 1);
    dec.read_to_end(&mut out)?;
    if out.len() as u64 > limit {
        return Err(bad_msg(
            "message is a possible zlib bomb; use --force to decode anyway",
        ));
    }
    Ok(out)
}

/// Build a forward onion packet over both legs of a path.
pub fn build_forward_packet<R: Rng + CryptoRng>(
    payload: Option<&[u8]>,
    exit_type: u16,
    exit_info: &[u8],
    leg1: &[ServerDescriptor],
    leg2: &[ServerDescriptor],
    rng: &mut R,
) -> Result<Vec<u8>> {
    if leg1.is_empty() {
        return Err(MixError::BadPath("forward path has an empty first leg".into()).into());
    }
    let mut core = Vec::new();
    core.extend_from_slice(&exit_type.to_be_bytes());
    core.extend_from_slice(&(exit_info.len() as u16).to_be_bytes());
    core.extend_from_slice(exit_info);
    core.extend_from_slice(&frame_payload(payload, rng)?);

    let body = onion(leg2, core, rng);
    let body = onion(leg1, body, rng);
    let mut packet = PACKET_MAGIC.to_vec();
    packet.extend_from_slice(&body);
    Ok(packet)
}

/// Build a reply block: the second half of an onion, ready for a stranger
/// to finish.  `surb_key` is the keyring key replies will be decoded with.
pub fn build_reply_block<R: Rng + CryptoRng>(
    leg: &[ServerDescriptor],
    exit_type: u16,
    exit_info: &[u8],
    surb_key: &[u8],
    expiry: OffsetDateTime,
    rng: &mut R,
) -> Result<ReplyBlock> {
    let first = leg
        .first()
        .ok_or_else(|| MixError::BadPath("reply path is empty".into()))?;
    let mut tag = [0u8; TAG_LEN];
    rng.fill_bytes(&mut tag);

    let mut core = Vec::new();
    core.extend_from_slice(&exit_type.to_be_bytes());
    core.extend_from_slice(&(exit_info.len() as u16).to_be_bytes());
    core.extend_from_slice(exit_info);
    core.extend_from_slice(&tag);
    // bind the header to the holder's key without revealing it
    core.extend_from_slice(&sha1(&[surb_key, &tag]));

    Ok(ReplyBlock {
        expiry,
        first_hop: first.routing().clone(),
        tag,
        header: onion(leg, core, rng),
    })
}

/// Build the packet that carries `payload` to a reply block's owner.
pub fn build_reply_packet<R: Rng + CryptoRng>(
    payload: &[u8],
    leg1: &[ServerDescriptor],
    surb: &ReplyBlock,
    rng: &mut R,
) -> Result<Vec<u8>> {
    let transit_key = derive_key(&[b"REPLY TRANSIT", surb.tag()]);
    let mut body = frame_payload(Some(payload), rng)?;
    ctr_crypt(&transit_key, &mut body);

    let mut core = surb.header.clone();
    core.extend_from_slice(&body);
    let body = onion(leg1, core, rng);
    let mut packet = PACKET_MAGIC.to_vec();
    packet.extend_from_slice(&body);
    Ok(packet)
}

fn reply_payload_key(surb_key: &[u8], tag: &[u8]) -> [u8; 16] {
    derive_key(&[b"REPLY PAYLOAD", surb_key, tag])
}

/// What the exit hop delivers to a reply block's owner: the framed payload
/// under the key only (surb_key, tag) can derive.
pub fn encrypt_reply_payload<R: Rng + CryptoRng>(
    payload: &[u8],
    tag: &[u8],
    surb_key: &[u8],
    rng: &mut R,
) -> Result<Vec<u8>> {
    let mut block = frame_payload(Some(payload), rng)?;
    ctr_crypt(&reply_payload_key(surb_key, tag), &mut block);
    Ok(block)
}

/// Decode a delivered reply payload with the keyring's reply key.
pub fn decode_payload(
    contents: &[u8],
    tag: &[u8],
    surb_key: &[u8],
    force: bool,
) -> Result<Vec<u8>> {
    let mut block = contents.to_vec();
    ctr_crypt(&reply_payload_key(surb_key, tag), &mut block);
    unframe_payload(&block, force)
}

/// An ascii-armored message as delivered to a recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextMessage {
    Plaintext(Vec<u8>),
    Encrypted { tag: Vec<u8>, contents: Vec<u8> },
}

pub fn armor_plaintext(contents: &[u8]) -> String {
    let mut out = String::new();
    out.push_str(MESSAGE_BEGIN);
    out.push_str("\nMessage-type: plaintext\n\n");
    out.push_str(&String::from_utf8_lossy(contents));
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(MESSAGE_END);
    out.push('\n');
    out
}

pub fn armor_encrypted(tag: &[u8], contents: &[u8]) -> String {
    let mut out = String::new();
    out.push_str(MESSAGE_BEGIN);
    out.push_str("\nMessage-type: encrypted\nDecoding-handle: ");
    out.push_str(&data_encoding::BASE64.encode(tag));
    out.push_str("\n\n");
    let encoded = data_encoding::BASE64.encode(contents);
    for chunk in encoded.as_bytes().chunks(64) {
        out.push_str(std::str::from_utf8(chunk).unwrap_or(""));
        out.push('\n');
    }
    out.push_str(MESSAGE_END);
    out.push('\n');
    out
}

/// Parse every armored message in `text`, in order.
pub fn parse_text_messages(text: &str) -> Result<Vec<TextMessage>> {
    let mut messages = Vec::new();
    let mut lines = text.lines();
    while let Some(line) = lines.next() {
        if line.trim() != MESSAGE_BEGIN {
            continue;
        }
        // headers run to the first blank line
        let mut message_type: Option<String> = None;
        let mut tag: Option<Vec<u8>> = None;
        for header in lines.by_ref() {
            let header = header.trim();
            if header.is_empty() {
                break;
            }
            let (name, value) = header
                .split_once(':')
                .ok_or_else(|| bad_msg(format!("malformed header {:?}", header)))?;
            match name {
                "Message-type" => message_type = Some(value.trim().to_owned()),
                "Decoding-handle" => {
                    tag = Some(
                        data_encoding::BASE64
                            .decode(value.trim().as_bytes())
                            .map_err(|e| bad_msg(format!("bad tag: {}", e)))?,
                    )
                }
                _ => return Err(bad_msg(format!("unknown header {:?}", name))),
            }
        }
        let mut body = String::new();
        let mut terminated = false;
        for line in lines.by_ref() {
            if line.trim() == MESSAGE_END {
                terminated = true;
                break;
            }
            body.push_str(line);
            body.push('\n');
        }
        if !terminated {
            return Err(bad_msg("unterminated message armor"));
        }
        match message_type.as_deref() {
            Some("plaintext") => {
                messages.push(TextMessage::Plaintext(body.into_bytes()))
            }
            Some("encrypted") => {
                let tag = tag.ok_or_else(|| bad_msg("encrypted message without a tag"))?;
                let joined: String =
                    body.split_whitespace().collect::<Vec<_>>().concat();
                let contents = data_encoding::BASE64
                    .decode(joined.as_bytes())
                    .map_err(|e| bad_msg(format!("bad base64 body: {}", e)))?;
                messages.push(TextMessage::Encrypted { tag, contents });
            }
            Some(other) => {
                return Err(bad_msg(format!("unknown message type {:?}", other)))
            }
            None => return Err(bad_msg("message has no Message-type header")),
        }
    }
    if messages.is_empty() {
        return Err(bad_msg("no armored messages found"));
    }
    Ok(messages)
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Reader<'a> {
        Reader { data, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos == self.data.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.data.len() - self.pos < n {
            return Err(eyre!("truncated input"));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(
            self.take(2)?.try_into().expect("sliced exactly two bytes"),
        ))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(
            self.take(4)?.try_into().expect("sliced exactly four bytes"),
        ))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(
            self.take(8)?.try_into().expect("sliced exactly eight bytes"),
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::{test_descriptor, test_surb};
    use crate::descriptor::Capability;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use time::macros::datetime;

    #[test]
    fn test_reply_block_pack_round_trip() {
        let surb = test_surb(7, datetime!(2026-08-10 0:00 UTC));
        let packed = surb.pack();
        let parsed = parse_reply_blocks(&packed).unwrap();
        assert_eq!(parsed, vec![surb.clone()]);

        // two concatenated blocks
        let other = test_surb(8, datetime!(2026-08-11 0:00 UTC));
        let mut both = surb.pack();
        both.extend(other.pack());
        let parsed = parse_reply_blocks(&both).unwrap();
        assert_eq!(parsed, vec![surb, other]);

        assert!(parse_reply_blocks(b"").is_err());
        assert!(parse_reply_blocks(b"SURB-0ZZ").is_err());
    }

    #[test]
    fn test_reply_block_text_round_trip() {
        let surb = test_surb(3, datetime!(2026-08-10 0:00 UTC));
        let armored = surb.pack_text();
        assert!(armored.starts_with(REPLY_BLOCK_BEGIN));
        let parsed = parse_text_reply_blocks(&armored).unwrap();
        assert_eq!(parsed, vec![surb.clone()]);

        // several blocks in one file, with noise between them
        let noise = format!("to: someone\n\n{}\nnoise\n{}", armored, armored);
        assert_eq!(parse_text_reply_blocks(&noise).unwrap().len(), 2);

        assert!(parse_text_reply_blocks("nothing here").is_err());
        assert!(
            parse_text_reply_blocks(&armored.replace(REPLY_BLOCK_END, "")).is_err()
        );
    }

    #[test]
    fn test_reply_payload_decode() {
        let mut rng = StdRng::seed_from_u64(99);
        let surb_key = [5u8; 20];
        let tag = [9u8; TAG_LEN];
        let payload = b"the eagle has landed";

        let delivered =
            encrypt_reply_payload(payload, &tag, &surb_key, &mut rng).unwrap();
        assert_eq!(delivered.len(), PAYLOAD_LEN);
        let decoded = decode_payload(&delivered, &tag, &surb_key, false).unwrap();
        assert_eq!(decoded, payload);

        // wrong key: checksum mismatch, not garbage output
        let err = decode_payload(&delivered, &tag, &[6u8; 20], false).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MixError>(),
            Some(MixError::BadMessage(_))
        ));
    }

    #[test]
    fn test_forward_packet_shape() {
        let mut rng = StdRng::seed_from_u64(1);
        let a = test_descriptor(
            "A",
            &[Capability::Relay],
            datetime!(2026-08-01 0:00 UTC),
            datetime!(2026-09-01 0:00 UTC),
        );
        let b = test_descriptor(
            "B",
            &[Capability::Relay, Capability::Smtp],
            datetime!(2026-08-01 0:00 UTC),
            datetime!(2026-09-01 0:00 UTC),
        );
        let packet = build_forward_packet(
            Some(b"hello"),
            crate::address::SMTP_TYPE,
            b"user@example.com",
            std::slice::from_ref(&a),
            std::slice::from_ref(&b),
            &mut rng,
        )
        .unwrap();
        assert!(packet.starts_with(PACKET_MAGIC));
        // magic + two layers of nonce + typed exit header + framed payload
        assert!(packet.len() > PAYLOAD_LEN);

        // identical inputs, fresh randomness: different bytes on the wire
        let mut rng2 = StdRng::seed_from_u64(2);
        let packet2 = build_forward_packet(
            Some(b"hello"),
            crate::address::SMTP_TYPE,
            b"user@example.com",
            std::slice::from_ref(&a),
            std::slice::from_ref(&b),
            &mut rng2,
        )
        .unwrap();
        assert_ne!(packet, packet2);

        assert!(build_forward_packet(
            None,
            crate::address::DROP_TYPE,
            b"",
            &[],
            std::slice::from_ref(&b),
            &mut rng,
        )
        .is_err());
    }

    #[test]
    fn test_build_reply_block_and_packet() {
        let mut rng = StdRng::seed_from_u64(12);
        let hop = test_descriptor(
            "Hop",
            &[Capability::Relay, Capability::Mbox],
            datetime!(2026-08-01 0:00 UTC),
            datetime!(2026-09-01 0:00 UTC),
        );
        let surb = build_reply_block(
            std::slice::from_ref(&hop),
            crate::address::MBOX_TYPE,
            b"joe",
            &[1u8; 20],
            datetime!(2026-08-15 0:00 UTC),
            &mut rng,
        )
        .unwrap();
        assert_eq!(surb.first_hop(), hop.routing());
        assert_eq!(surb.expiry(), datetime!(2026-08-15 0:00 UTC));

        let packet =
            build_reply_packet(b"reply text", std::slice::from_ref(&hop), &surb, &mut rng)
                .unwrap();
        assert!(packet.starts_with(PACKET_MAGIC));

        assert!(build_reply_block(
            &[],
            crate::address::MBOX_TYPE,
            b"joe",
            &[1u8; 20],
            datetime!(2026-08-15 0:00 UTC),
            &mut rng,
        )
        .is_err());
    }

    #[test]
    fn test_armored_messages() {
        let plain = armor_plaintext(b"hello there\n");
        let parsed = parse_text_messages(&plain).unwrap();
        assert_eq!(parsed, vec![TextMessage::Plaintext(b"hello there\n".to_vec())]);

        let enc = armor_encrypted(&[9u8; TAG_LEN], b"ciphertext bytes");
        let parsed = parse_text_messages(&enc).unwrap();
        assert_eq!(
            parsed,
            vec![TextMessage::Encrypted {
                tag: vec![9u8; TAG_LEN],
                contents: b"ciphertext bytes".to_vec(),
            }]
        );

        // several messages with junk between parse in order
        let both = format!("junk\n{}\nmore junk\n{}", plain, enc);
        assert_eq!(parse_text_messages(&both).unwrap().len(), 2);

        assert!(parse_text_messages("no armor at all").is_err());
        assert!(parse_text_messages(
            &plain.replace("Message-type: plaintext", "Message-type: sparkly")
        )
        .is_err());
    }

    #[test]
    fn test_zlib_bomb_guard() {
        let mut rng = StdRng::seed_from_u64(5);
        let bomb = vec![0u8; 200_000];
        let surb_key = [5u8; 20];
        let tag = [9u8; TAG_LEN];
        let delivered =
            encrypt_reply_payload(&bomb, &tag, &surb_key, &mut rng).unwrap();
        let err = decode_payload(&delivered, &tag, &surb_key, false).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MixError>(),
            Some(MixError::BadMessage(_))
        ));
        // --force decodes it anyway
        let decoded = decode_payload(&delivered, &tag, &surb_key, true).unwrap();
        assert_eq!(decoded, bomb);
    }
}
