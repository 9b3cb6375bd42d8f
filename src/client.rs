//! The delivery coordinator: composes the keyring, spool, reply-block log,
//! packet builder, and transport into the user-visible send/reply/flush
//! flows.

use crate::address::Address;
use crate::config::ClientConfig;
use crate::descriptor::{RoutingInfo, ServerDescriptor};
use crate::keyring::{ClientKeyring, PasswordPrompt};
use crate::lock::ClientLock;
use crate::packet::{self, ReplyBlock, TextMessage};
use crate::prelude::*;
use crate::spool::{PacketSpool, SpoolSummary};
use crate::surblog::SurbLog;
use crate::transport::Transport;
use crate::util::{create_private_dir, format_time};
use rand::{CryptoRng, Rng};
use time::Duration;

/// Reply blocks with less than this much life left are never used.
const MIN_SURB_LIFE: Duration = Duration::seconds(60);
/// Below this we still use the block, but warn about the deadline.
const SURB_LIFE_WARNING: Duration = Duration::hours(3);

/// What to do with a packet besides (or instead of) transmitting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePolicy {
    /// Queue it and stop; delivery happens at the next flush.
    SpoolOnly,
    /// Queue first, then transmit; delivered packets leave the queue.
    /// A crash can therefore never lose a packet.
    SpoolFirst,
    /// Transmit, and queue only if that fails.
    Lazy,
    /// Transmit or lose it.
    Never,
}

pub struct MixClient<'a, T: Transport> {
    config: &'a ClientConfig,
    lock: &'a ClientLock,
    transport: T,
    keyring: ClientKeyring,
    spool: PacketSpool,
    surb_log_path: PathBuf,
}

impl<'a, T: Transport> MixClient<'a, T> {
    pub fn new(
        config: &'a ClientConfig,
        lock: &'a ClientLock,
        transport: T,
    ) -> Result<MixClient<'a, T>> {
        let userdir = config.user_dir();
        create_private_dir(&userdir)?;
        Ok(MixClient {
            config,
            lock,
            transport,
            keyring: ClientKeyring::new(&userdir.join("keys"))?,
            spool: PacketSpool::new(&userdir.join("pool"), config.shred_command())?,
            surb_log_path: userdir.join("surbs").join("log"),
        })
    }

    /// Build and deliver a forward message along a resolved two-leg path.
    pub fn send_forward<R: Rng + CryptoRng>(
        &mut self,
        rng: &mut R,
        address: &Address,
        payload: Option<&[u8]>,
        leg1: &[ServerDescriptor],
        leg2: &[ServerDescriptor],
        policy: QueuePolicy,
    ) -> Result<()> {
        info!("Generating payload...");
        let packet = packet::build_forward_packet(
            payload,
            address.exit_type(),
            address.exit_info(),
            leg1,
            leg2,
            rng,
        )?;
        let first = leg1
            .first()
            .ok_or_else(|| MixError::BadPath("first leg is empty".into()))?;
        let routing = first.routing().clone();
        self.send_packets(rng, &[packet], &routing, policy)
    }

    /// Build and deliver a reply using the first unspent, unexpired block
    /// in `surbs`.
    pub fn send_reply<R: Rng + CryptoRng>(
        &mut self,
        rng: &mut R,
        payload: &[u8],
        leg1: &[ServerDescriptor],
        surbs: &[ReplyBlock],
        policy: QueuePolicy,
        now: OffsetDateTime,
    ) -> Result<()> {
        let (packet, routing) = self.generate_reply(rng, payload, leg1, surbs, now)?;
        self.send_packets(rng, &[packet], &routing, policy)
    }

    fn generate_reply<R: Rng + CryptoRng>(
        &mut self,
        rng: &mut R,
        payload: &[u8],
        leg1: &[ServerDescriptor],
        surbs: &[ReplyBlock],
        now: OffsetDateTime,
    ) -> Result<(Vec<u8>, RoutingInfo)> {
        let guard = self.lock.acquire()?;
        let mut log = SurbLog::open(&guard, &self.surb_log_path, now)?;
        for surb in surbs {
            let time_left = surb.expiry() - now;
            if log.is_used(surb) {
                warn!("Skipping used reply block");
                continue;
            }
            if time_left < MIN_SURB_LIFE {
                warn!(
                    "Skipping reply block that expires at {}",
                    format_time(surb.expiry())
                );
                continue;
            }
            if time_left < SURB_LIFE_WARNING {
                warn!(
                    "Reply block will expire in {} hours, {} minutes",
                    time_left.whole_hours(),
                    time_left.whole_minutes() % 60,
                );
            }
            info!("Generating payload...");
            let packet = packet::build_reply_packet(payload, leg1, surb, rng)?;
            // durable before the transport sees the packet: a crash between
            // here and delivery loses a reply, never reuses a block
            log.mark_used(surb)?;
            let routing = match leg1.first() {
                Some(first) => first.routing().clone(),
                None => surb.first_hop().clone(),
            };
            log.close()?;
            return Ok((packet, routing));
        }
        log.close()?;
        Err(MixError::NoUsableSurbs.into())
    }

    /// Generate a reply block for `address` along `leg`, creating the
    /// keyring's reply key on first use.
    pub fn generate_reply_block<R: Rng + CryptoRng>(
        &mut self,
        rng: &mut R,
        prompt: &mut dyn PasswordPrompt,
        address: &Address,
        leg: &[ServerDescriptor],
        expiry: OffsetDateTime,
    ) -> Result<ReplyBlock> {
        let key = self.keyring.get_or_create_surb_key(prompt, rng)?;
        packet::build_reply_block(
            leg,
            address.exit_type(),
            address.exit_info(),
            &key,
            expiry,
            rng,
        )
    }

    /// Decode every armored message in `text`.  Encrypted messages need
    /// the keyring's reply key.
    pub fn decode_message(
        &mut self,
        text: &str,
        force: bool,
        prompt: &mut dyn PasswordPrompt,
    ) -> Result<Vec<Vec<u8>>> {
        let mut results = Vec::new();
        for message in packet::parse_text_messages(text)? {
            match message {
                TextMessage::Plaintext(contents) => results.push(contents),
                TextMessage::Encrypted { tag, contents } => {
                    let key =
                        self.keyring.get_surb_key(prompt)?.ok_or_else(|| {
                            MixError::BadMessage(
                                "no reply block key; can't decode an encrypted reply"
                                    .into(),
                            )
                        })?;
                    results.push(packet::decode_payload(
                        &contents, &tag, &key, force,
                    )?);
                }
            }
        }
        Ok(results)
    }

    fn spool_packets<R: Rng + CryptoRng>(
        &mut self,
        rng: &mut R,
        packets: &[Vec<u8>],
        routing: &RoutingInfo,
    ) -> Result<Vec<String>> {
        trace!("Queueing packets");
        let guard = self.lock.acquire()?;
        let now = OffsetDateTime::now_utc();
        let mut handles = Vec::with_capacity(packets.len());
        for packet in packets {
            handles.push(self.spool.enqueue(&guard, rng, packet, routing, now)?);
        }
        if handles.len() > 1 {
            info!("Packets queued");
        } else {
            info!("Packet queued");
        }
        Ok(handles)
    }

    fn send_packets<R: Rng + CryptoRng>(
        &mut self,
        rng: &mut R,
        packets: &[Vec<u8>],
        routing: &RoutingInfo,
        policy: QueuePolicy,
    ) -> Result<()> {
        let handles = match policy {
            QueuePolicy::SpoolOnly | QueuePolicy::SpoolFirst => {
                self.spool_packets(rng, packets, routing)?
            }
            QueuePolicy::Lazy | QueuePolicy::Never => Vec::new(),
        };
        if policy == QueuePolicy::SpoolOnly {
            return Ok(());
        }

        info!("Connecting to {}...", routing);
        let timeout = self.config.connection_timeout();
        match self.transport.send_packets(routing, packets, timeout) {
            Ok(()) => {
                let guard = self.lock.acquire()?;
                for handle in &handles {
                    if self.spool.exists(handle) {
                        self.spool.remove(&guard, handle)?;
                    }
                }
                Ok(())
            }
            Err(e) => match policy {
                QueuePolicy::Never => {
                    error!("Error with queueing disabled: packet lost ({})", e);
                    Err(MixError::MessageLost.into())
                }
                QueuePolicy::Lazy => {
                    info!("Error while delivering packet; queueing");
                    self.spool_packets(rng, packets, routing)?;
                    Err(e)
                }
                QueuePolicy::SpoolOnly | QueuePolicy::SpoolFirst => {
                    info!("Error while delivering packet; leaving in queue");
                    Err(e)
                }
            },
        }
    }

    /// Try to deliver everything in the queue, one first hop at a time.
    /// Failures leave the affected packets queued for next time.
    pub fn flush_spool(&mut self) -> Result<()> {
        info!("Flushing packet queue");
        let mut by_server: HashMap<RoutingInfo, Vec<(Vec<u8>, String)>> =
            HashMap::new();
        {
            let guard = self.lock.acquire()?;
            let handles = self.spool.handles(&guard)?;
            info!("Found {} pending packets", handles.len());
            for handle in handles {
                match self.spool.load(&handle) {
                    Ok((packet, routing, _)) => {
                        by_server.entry(routing).or_default().push((packet, handle))
                    }
                    Err(e) => warn!("Skipping unreadable spool entry {}: {}", handle, e),
                }
            }
        }

        let mut groups: Vec<(RoutingInfo, Vec<(Vec<u8>, String)>)> =
            by_server.into_iter().collect();
        groups.sort_by(|a, b| a.0.to_string().cmp(&b.0.to_string()));

        let timeout = self.config.connection_timeout();
        for (routing, entries) in groups {
            info!("Sending {} packets to {}...", entries.len(), routing);
            let packets: Vec<Vec<u8>> =
                entries.iter().map(|(packet, _)| packet.clone()).collect();
            // transmit outside the lock; other processes can make progress
            match self.transport.send_packets(&routing, &packets, timeout) {
                Ok(()) => {
                    info!("... packets sent.");
                    let guard = self.lock.acquire()?;
                    for (_, handle) in &entries {
                        if self.spool.exists(handle) {
                            self.spool.remove(&guard, handle)?;
                        }
                    }
                }
                Err(e) => {
                    error!(
                        "Can't deliver packets to {}; leaving in queue ({})",
                        routing, e
                    );
                }
            }
        }
        info!("Queue flushed");
        Ok(())
    }

    /// Summarize what's waiting in the queue.
    pub fn inspect_spool(&self, now: OffsetDateTime) -> Result<Vec<SpoolSummary>> {
        let guard = self.lock.acquire()?;
        self.spool.inspect(&guard, now)
    }

    #[cfg(test)]
    pub fn spool(&self) -> &PacketSpool {
        &self.spool
    }

    #[cfg(test)]
    pub fn keyring_mut(&mut self) -> &mut ClientKeyring {
        &mut self.keyring
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::descriptor::Capability;
    use crate::test_util::{
        test_config, test_descriptor, test_surb, MockTransport, ScriptedPrompt,
    };
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use time::macros::datetime;

    fn hop(name: &str) -> ServerDescriptor {
        test_descriptor(
            name,
            &[Capability::Relay, Capability::Smtp, Capability::Mbox],
            datetime!(2026-08-01 0:00 UTC),
            datetime!(2026-09-01 0:00 UTC),
        )
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        config: ClientConfig,
        lock: ClientLock,
    }

    impl Fixture {
        fn new() -> Fixture {
            let tmp = tempfile::tempdir().unwrap();
            let config = test_config(&tmp.path().join("state"));
            let lock = ClientLock::new(&tmp.path().join("state").join("lock"));
            Fixture {
                _tmp: tmp,
                config,
                lock,
            }
        }

        fn client(&self, transport: MockTransport) -> MixClient<'_, MockTransport> {
            MixClient::new(&self.config, &self.lock, transport).unwrap()
        }
    }

    #[test]
    fn test_forward_failure_leaves_packet_queued() -> Result<()> {
        let fx = Fixture::new();
        let mut client = fx.client(MockTransport::failing());
        let mut rng = StdRng::seed_from_u64(2);
        let address: Address = "user@example.com".parse()?;
        let (a, b) = (hop("A"), hop("B"));

        let err = client
            .send_forward(
                &mut rng,
                &address,
                Some(b"hi"),
                std::slice::from_ref(&a),
                std::slice::from_ref(&b),
                QueuePolicy::SpoolFirst,
            )
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MixError>(),
            Some(MixError::Protocol(_))
        ));

        // the packet survived in the spool...
        let guard = fx.lock.acquire()?;
        let handles = client.spool().handles(&guard)?;
        assert_eq!(handles.len(), 1);
        let (_, routing, _) = client.spool().load(&handles[0])?;
        assert_eq!(&routing, a.routing());
        drop(guard);

        // ... and a flush against a healthy transport clears it
        let mut client = fx.client(MockTransport::working());
        client.flush_spool()?;
        let guard = fx.lock.acquire()?;
        assert!(client.spool().handles(&guard)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_force_no_spool_loses_packet() -> Result<()> {
        let fx = Fixture::new();
        let mut client = fx.client(MockTransport::failing());
        let mut rng = StdRng::seed_from_u64(2);
        let address: Address = "user@example.com".parse()?;
        let (a, b) = (hop("A"), hop("B"));

        let err = client
            .send_forward(
                &mut rng,
                &address,
                Some(b"hi"),
                std::slice::from_ref(&a),
                std::slice::from_ref(&b),
                QueuePolicy::Never,
            )
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MixError>(),
            Some(MixError::MessageLost)
        ));
        let guard = fx.lock.acquire()?;
        assert!(client.spool().handles(&guard)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_lazy_spool_queues_only_on_failure() -> Result<()> {
        let fx = Fixture::new();
        let mut rng = StdRng::seed_from_u64(2);
        let address: Address = "user@example.com".parse()?;
        let (a, b) = (hop("A"), hop("B"));

        let mut client = fx.client(MockTransport::working());
        client.send_forward(
            &mut rng,
            &address,
            Some(b"hi"),
            std::slice::from_ref(&a),
            std::slice::from_ref(&b),
            QueuePolicy::Lazy,
        )?;
        let guard = fx.lock.acquire()?;
        assert!(client.spool().handles(&guard)?.is_empty());
        drop(guard);

        let mut client = fx.client(MockTransport::failing());
        assert!(client
            .send_forward(
                &mut rng,
                &address,
                Some(b"hi"),
                std::slice::from_ref(&a),
                std::slice::from_ref(&b),
                QueuePolicy::Lazy,
            )
            .is_err());
        let guard = fx.lock.acquire()?;
        assert_eq!(client.spool().handles(&guard)?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_spool_only_never_touches_transport() -> Result<()> {
        let fx = Fixture::new();
        let transport = MockTransport::failing();
        let mut client = fx.client(transport);
        let mut rng = StdRng::seed_from_u64(2);
        let address: Address = "user@example.com".parse()?;
        let (a, b) = (hop("A"), hop("B"));

        client.send_forward(
            &mut rng,
            &address,
            Some(b"hi"),
            std::slice::from_ref(&a),
            std::slice::from_ref(&b),
            QueuePolicy::SpoolOnly,
        )?;
        assert_eq!(client.transport.attempts(), 0);
        let guard = fx.lock.acquire()?;
        assert_eq!(client.spool().handles(&guard)?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_used_surb_is_skipped_before_transport() -> Result<()> {
        let fx = Fixture::new();
        let mut client = fx.client(MockTransport::working());
        let mut rng = StdRng::seed_from_u64(2);
        let now = datetime!(2026-08-01 12:00 UTC);
        let surb = test_surb(1, datetime!(2026-08-10 0:00 UTC));
        let leg = vec![hop("A")];

        // spend it
        client.send_reply(
            &mut rng,
            b"first reply",
            &leg,
            std::slice::from_ref(&surb),
            QueuePolicy::Never,
            now,
        )?;
        assert_eq!(client.transport.attempts(), 1);

        // the same block again: refused, transport untouched
        let err = client
            .send_reply(
                &mut rng,
                b"second reply",
                &leg,
                std::slice::from_ref(&surb),
                QueuePolicy::Never,
                now,
            )
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MixError>(),
            Some(MixError::NoUsableSurbs)
        ));
        assert_eq!(client.transport.attempts(), 1);
        Ok(())
    }

    #[test]
    fn test_expiring_surbs() -> Result<()> {
        let fx = Fixture::new();
        let mut client = fx.client(MockTransport::working());
        let mut rng = StdRng::seed_from_u64(2);
        let now = datetime!(2026-08-01 12:00 UTC);
        let leg = vec![hop("A")];

        // 30 seconds of life left: skipped entirely
        let nearly_dead = test_surb(1, datetime!(2026-08-01 12:00:30 UTC));
        // two hours left: used, with a warning
        let dying = test_surb(2, datetime!(2026-08-01 14:00 UTC));
        client.send_reply(
            &mut rng,
            b"hurry",
            &leg,
            &[nearly_dead.clone(), dying.clone()],
            QueuePolicy::Never,
            now,
        )?;

        // the nearly-dead block was never marked used
        let guard = fx.lock.acquire()?;
        let log = SurbLog::open(&guard, &fx.config.user_dir().join("surbs").join("log"), now)?;
        assert!(!log.is_used(&nearly_dead));
        assert!(log.is_used(&dying));
        Ok(())
    }

    #[test]
    fn test_decode_plain_and_encrypted() -> Result<()> {
        let fx = Fixture::new();
        let mut client = fx.client(MockTransport::working());
        let mut rng = StdRng::seed_from_u64(2);

        // create the reply key
        let mut prompt = ScriptedPrompt::new(&["pw"]);
        let key = client
            .keyring_mut()
            .get_or_create_surb_key(&mut prompt, &mut rng)?;

        let tag = [3u8; packet::TAG_LEN];
        let delivered =
            packet::encrypt_reply_payload(b"secret reply", &tag, &key, &mut rng)?;
        let text = format!(
            "{}{}",
            packet::armor_plaintext(b"plain text\n"),
            packet::armor_encrypted(&tag, &delivered),
        );
        let mut prompt = ScriptedPrompt::new(&[]);
        let decoded = client.decode_message(&text, false, &mut prompt)?;
        assert_eq!(decoded, vec![b"plain text\n".to_vec(), b"secret reply".to_vec()]);
        Ok(())
    }
}
