//! Turning a terse user path specification ("Foo,*,Bar", "a,b:c,d", ...)
//! into a validated two-leg route through the mix network.

use crate::address::Address;
use crate::descriptor::{Capability, ServerDescriptor};
use crate::directory::ClientDirectory;
use crate::prelude::*;
use rand::seq::SliceRandom;
use rand::{CryptoRng, Rng};

pub const DEFAULT_HOPS: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSpec {
    /// Named entries before the `*` wildcard.
    pub enter: Vec<String>,
    /// Named entries after the `*` wildcard.
    pub exit: Vec<String>,
    /// Token position of the wildcard, if present.
    pub star_pos: Option<usize>,
    /// Token position of the leg separator, if present.
    pub swap_pos: Option<usize>,
    /// Total token count, wildcard and separator included.
    pub n_tokens: usize,
}

fn bad(msg: impl Into<String>) -> eyre::Report {
    MixError::BadPath(msg.into()).into()
}

/// Parse a path specification.  Entries are comma-separated server
/// nicknames or descriptor filenames; `*` marks where randomly-selected
/// servers go, and a colon (in place of a comma) separates the two legs.
/// A missing path is the same as "*".
pub fn parse_path_spec(path: Option<&str>) -> Result<PathSpec> {
    let path = match path {
        None | Some("") => "*",
        Some(p) => p,
    };
    // A colon is not a valid nickname character, so it's safe to rewrite it
    // into its own token.
    let rewritten = path.replace(':', ",:,");
    let tokens: Vec<&str> = rewritten.split(',').map(str::trim).collect();

    let mut spec = PathSpec {
        enter: Vec::new(),
        exit: Vec::new(),
        star_pos: None,
        swap_pos: None,
        n_tokens: tokens.len(),
    };
    let mut past_star = false;
    for (idx, token) in tokens.iter().enumerate() {
        match *token {
            "*" => {
                if spec.star_pos.is_some() {
                    return Err(bad("can't have two wildcards in a path"));
                }
                spec.star_pos = Some(idx);
                past_star = true;
            }
            ":" => {
                if spec.swap_pos.is_some() {
                    return Err(bad("can't specify the swap point twice"));
                }
                spec.swap_pos = Some(idx);
            }
            "" => return Err(bad("empty server name in path")),
            name => {
                if past_star {
                    spec.exit.push(name.to_owned());
                } else {
                    spec.enter.push(name.to_owned());
                }
            }
        }
    }
    Ok(spec)
}

/// Resolve a path specification into (leg1, leg2).
///
/// The address's exit node (if any) is appended to the second leg.  With
/// `half_path`, an empty first leg is legal (pass `n_swap` = -1 to request
/// one); otherwise both legs must end up non-empty.
#[allow(clippy::too_many_arguments)]
pub fn parse_path<R: Rng + CryptoRng>(
    dir: &ClientDirectory,
    rng: &mut R,
    path: Option<&str>,
    address: Option<&Address>,
    n_hops: Option<usize>,
    n_swap: Option<isize>,
    start: OffsetDateTime,
    end: OffsetDateTime,
    half_path: bool,
    default_hops: Option<usize>,
) -> Result<(Vec<ServerDescriptor>, Vec<ServerDescriptor>)> {
    context!("resolving path {}", path.unwrap_or("*"));
    let spec = parse_path_spec(path)?;

    let my_n_hops = match spec.star_pos {
        None => spec.enter.len() + spec.exit.len(),
        Some(_) => n_hops
            .or(default_hops)
            .unwrap_or(DEFAULT_HOPS),
    };

    // Infer the swap point from the colon's position.
    let derived_swap: Option<isize> = match (spec.swap_pos, spec.star_pos) {
        (None, _) => None,
        // a,b:c,d  or  a,b:c,*,d -- count the named servers before it
        (Some(sp), None) => Some(sp as isize - 1),
        (Some(sp), Some(star)) if sp < star => Some(sp as isize - 1),
        (Some(sp), Some(_)) => {
            // a,*,b:c,d -- there are n_tokens-sp-1 servers after the swap
            // point, so the swap server sits my_n_hops - (n_tokens-sp-1) - 1
            // hops in ...
            let mut v = my_n_hops as isize - spec.n_tokens as isize + sp as isize;
            // ... adjusted for the last hop the address may force us to add.
            if address.and_then(Address::last_hop).is_some() {
                v -= 1;
            }
            Some(v)
        }
    };
    let my_n_swap = match (n_swap, derived_swap) {
        (Some(explicit), Some(derived)) if explicit != derived => {
            return Err(MixError::SwapMismatch.into())
        }
        (Some(explicit), _) => Some(explicit),
        (None, derived) => derived,
    };

    if let Some(hops) = n_hops {
        if spec.star_pos.is_none() && my_n_hops != hops {
            return Err(MixError::HopCountMismatch.into());
        }
        if hops < spec.enter.len() + spec.exit.len() {
            return Err(MixError::HopCountMismatch.into());
        }
    }

    resolve_path(
        dir, rng, address, &spec.enter, &spec.exit, my_n_hops, my_n_swap, start,
        end, half_path,
    )
}

/// Resolve a reply-path specification: one leg, ending at the address.
pub fn parse_path_leg<R: Rng + CryptoRng>(
    dir: &ClientDirectory,
    rng: &mut R,
    path: Option<&str>,
    address: Option<&Address>,
    n_hops: Option<usize>,
    start: OffsetDateTime,
    end: OffsetDateTime,
    default_hops: Option<usize>,
) -> Result<Vec<ServerDescriptor>> {
    let (leg1, leg2) = parse_path(
        dir,
        rng,
        path,
        address,
        n_hops,
        Some(-1),
        start,
        end,
        true,
        default_hops,
    )?;
    debug_assert!(leg1.is_empty());
    Ok(leg2)
}

fn ceil_div(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

#[allow(clippy::too_many_arguments)]
fn resolve_path<R: Rng + CryptoRng>(
    dir: &ClientDirectory,
    rng: &mut R,
    address: Option<&Address>,
    enter: &[String],
    exit: &[String],
    n_hops: usize,
    n_swap: Option<isize>,
    start: OffsetDateTime,
    end: OffsetDateTime,
    half_path: bool,
) -> Result<(Vec<ServerDescriptor>, Vec<ServerDescriptor>)> {
    let exit_cap = address.and_then(Address::exit_capability);

    let enter_servers = enter
        .iter()
        .map(|name| dir.require_server(name, start, end))
        .collect::<Result<Vec<_>>>()?;
    let mut exit_names: Vec<&str> = exit.iter().map(String::as_str).collect();
    if let Some(last) = address.and_then(Address::last_hop) {
        exit_names.push(last);
    }
    let exit_servers = exit_names
        .iter()
        .map(|name| dir.require_server(name, start, end))
        .collect::<Result<Vec<_>>>()?;

    let path = select_path(
        dir,
        rng,
        n_hops,
        enter_servers,
        exit_servers,
        Capability::Relay,
        exit_cap,
        start,
        end,
    )?;
    if path.is_empty() {
        return Err(bad("path must have at least one hop"));
    }

    for info in &path[..path.len() - 1] {
        if !info.has_capability(Capability::Relay) {
            return Err(MixError::CapabilityViolation {
                nickname: info.nickname().to_owned(),
                capability: Capability::Relay.to_string(),
            }
            .into());
        }
    }
    if let Some(cap) = exit_cap {
        let last = &path[path.len() - 1];
        if !last.has_capability(cap) {
            return Err(MixError::CapabilityViolation {
                nickname: last.nickname().to_owned(),
                capability: cap.to_string(),
            }
            .into());
        }
    }

    let n_swap = n_swap.unwrap_or(ceil_div(path.len(), 2) as isize - 1);
    if n_swap < -1 || n_swap >= path.len() as isize {
        return Err(bad(format!("swap point {} is outside the path", n_swap + 1)));
    }
    let split = (n_swap + 1) as usize;
    let leg2 = path[split..].to_vec();
    let mut leg1 = path;
    leg1.truncate(split);
    if !half_path && (leg1.is_empty() || leg2.is_empty()) {
        return Err(bad("each leg of the path must have at least 1 hop"));
    }
    Ok((leg1, leg2))
}

/// Workhorse of path selection: build a path of `length` hops beginning
/// with `start_servers` and ending with `end_servers`, picking any missing
/// servers at random.  Newly-selected non-terminal hops must advertise
/// `mid_cap`; a newly-selected terminal hop must advertise `end_cap`.
///
/// The selection gets better the more servers we know about; with only a
/// handful of relays we settle for progressively weaker distinctness
/// guarantees rather than refuse to build a path at all.
#[allow(clippy::too_many_arguments)]
fn select_path<R: Rng + CryptoRng>(
    dir: &ClientDirectory,
    rng: &mut R,
    length: usize,
    start_servers: Vec<ServerDescriptor>,
    mut end_servers: Vec<ServerDescriptor>,
    mid_cap: Capability,
    end_cap: Option<Capability>,
    start: OffsetDateTime,
    end: OffsetDateTime,
) -> Result<Vec<ServerDescriptor>> {
    let mut n_needed =
        length.saturating_sub(start_servers.len() + end_servers.len());

    if n_needed > 0 && end_servers.is_empty() {
        let end_list = dir.candidates(end_cap, start, end);
        if end_list.is_empty() {
            return Err(match end_cap {
                Some(_) => MixError::NoExitServers.into(),
                None => MixError::NoRelaysKnown.into(),
            });
        }
        // Prefer an exit that isn't already on the path.
        let used: HashSet<String> =
            start_servers.iter().map(ServerDescriptor::lc_nickname).collect();
        let unused: Vec<&ServerDescriptor> = end_list
            .iter()
            .filter(|info| !used.contains(&info.lc_nickname()))
            .collect();
        let pick = if unused.is_empty() {
            end_list
                .choose(rng)
                .ok_or_else(|| eyre!("exit candidates unexpectedly empty"))?
                .clone()
        } else {
            (*unused
                .choose(rng)
                .ok_or_else(|| eyre!("exit candidates unexpectedly empty"))?)
            .clone()
        };
        debug!("Chose {} as exit server", pick.nickname());
        end_servers.push(pick);
        n_needed -= 1;
    }

    if n_needed == 0 {
        let mut path = start_servers;
        path.extend(end_servers);
        return Ok(path);
    }

    let mid_list = dir.candidates(Some(mid_cap), start, end);
    let used: HashSet<String> = start_servers
        .iter()
        .chain(end_servers.iter())
        .map(ServerDescriptor::lc_nickname)
        .collect();
    let unused_mid: Vec<&ServerDescriptor> = mid_list
        .iter()
        .filter(|info| !used.contains(&info.lc_nickname()))
        .collect();

    let mid_servers: Vec<ServerDescriptor> = if unused_mid.len() >= n_needed {
        // Enough candidates to choose without replacement.
        unused_mid
            .choose_multiple(rng, n_needed)
            .map(|info| (**info).clone())
            .collect()
    } else if mid_list.len() >= 3 {
        // Enough to at least avoid the same server twice in a row.
        warn!(
            "Not enough servers for distinct path ({} unused, {} known)",
            unused_mid.len(),
            mid_list.len()
        );
        let mut picked = Vec::with_capacity(n_needed);
        let mut prev = start_servers.last().map(ServerDescriptor::lc_nickname);
        let end_nick = end_servers.first().map(ServerDescriptor::lc_nickname);
        let mut remaining = n_needed;
        while remaining > 0 {
            let info = mid_list
                .choose(rng)
                .ok_or_else(|| eyre!("relay candidates unexpectedly empty"))?;
            let nick = info.lc_nickname();
            if Some(&nick) != prev.as_ref()
                && (remaining > 1 || Some(&nick) != end_nick.as_ref())
            {
                picked.push(info.clone());
                prev = Some(nick);
                remaining -= 1;
            }
        }
        picked
    } else if mid_list.len() == 2 {
        // The best we can do is alternate between the two.
        warn!("Not enough relays to avoid same-server hops");
        let mut pair = mid_list.clone();
        pair.shuffle(rng);
        (0..n_needed).map(|i| pair[i % 2].clone()).collect()
    } else if mid_list.len() == 1 {
        // No point in a longer path: it can only have one server in it.
        warn!("Only one relay known");
        mid_list.clone()
    } else {
        return Err(MixError::NoRelaysKnown.into());
    };

    debug!(
        "Selected path is [{}][{}][{}]",
        join_nicknames(&start_servers),
        join_nicknames(&mid_servers),
        join_nicknames(&end_servers),
    );

    let mut path = start_servers;
    path.extend(mid_servers);
    path.extend(end_servers);
    Ok(path)
}

pub fn join_nicknames(servers: &[ServerDescriptor]) -> String {
    servers
        .iter()
        .map(ServerDescriptor::nickname)
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::lock::ClientLock;
    use crate::test_util::{relay_pool, test_state_dir, SPAN_END, SPAN_START};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn spec(path: &str) -> PathSpec {
        parse_path_spec(Some(path)).unwrap()
    }

    #[test]
    fn test_parse_path_spec() {
        let s = spec("foo,bar,*,quux");
        assert_eq!(s.enter, ["foo", "bar"]);
        assert_eq!(s.exit, ["quux"]);
        assert_eq!(s.star_pos, Some(2));
        assert_eq!(s.swap_pos, None);
        assert_eq!(s.n_tokens, 4);

        let s = spec("foo, bar : baz ,quux");
        assert_eq!(s.enter, ["foo", "bar", "baz", "quux"]);
        assert_eq!(s.swap_pos, Some(2));

        let s = spec("a,*,b:c,d");
        assert_eq!(s.enter, ["a"]);
        assert_eq!(s.exit, ["b", "c", "d"]);
        assert_eq!(s.star_pos, Some(1));
        assert_eq!(s.swap_pos, Some(3));
        assert_eq!(s.n_tokens, 6);

        assert_eq!(parse_path_spec(None).unwrap(), spec("*"));
        assert_eq!(parse_path_spec(Some("")).unwrap(), spec("*"));

        assert!(parse_path_spec(Some("a,*,b,*,c")).is_err());
        assert!(parse_path_spec(Some("a:b:c")).is_err());
        assert!(parse_path_spec(Some("a,,b")).is_err());
    }

    fn mix_err(err: &eyre::Report) -> &MixError {
        err.downcast_ref::<MixError>().expect("expected a MixError")
    }

    #[test]
    fn test_named_path_with_swap() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let lock = ClientLock::new(&tmp.path().join("lock"));
        let dir = relay_pool(&test_state_dir(tmp.path()), &lock, 6)?;
        let mut rng = StdRng::seed_from_u64(1);

        // "A,B:C,D" swaps after the second hop
        let (leg1, leg2) = parse_path(
            &dir,
            &mut rng,
            Some("Relay0,Relay1:Relay2,Relay3"),
            None,
            None,
            None,
            SPAN_START,
            SPAN_END,
            false,
            None,
        )?;
        assert_eq!(join_nicknames(&leg1), "Relay0,Relay1");
        assert_eq!(join_nicknames(&leg2), "Relay2,Relay3");

        // --swap-at agreeing with the colon is fine (user-visible 2 == index 1)
        let ok = parse_path(
            &dir,
            &mut rng,
            Some("Relay0,Relay1:Relay2,Relay3"),
            None,
            None,
            Some(1),
            SPAN_START,
            SPAN_END,
            false,
            None,
        );
        assert!(ok.is_ok());

        // ... and disagreeing is not
        let err = parse_path(
            &dir,
            &mut rng,
            Some("Relay0,Relay1:Relay2,Relay3"),
            None,
            None,
            Some(0),
            SPAN_START,
            SPAN_END,
            false,
            None,
        )
        .unwrap_err();
        assert!(matches!(mix_err(&err), MixError::SwapMismatch));
        Ok(())
    }

    #[test]
    fn test_wildcard_fill_distinct() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let lock = ClientLock::new(&tmp.path().join("lock"));
        let dir = relay_pool(&test_state_dir(tmp.path()), &lock, 8)?;
        let mut rng = StdRng::seed_from_u64(7);

        let address: Address = "user@example.com".parse()?;
        let (leg1, leg2) = parse_path(
            &dir,
            &mut rng,
            Some("Relay0,*,Relay1"),
            Some(&address),
            Some(4),
            None,
            SPAN_START,
            SPAN_END,
            false,
            None,
        )?;
        let path: Vec<ServerDescriptor> =
            leg1.iter().chain(leg2.iter()).cloned().collect();
        assert_eq!(path.len(), 4);
        assert_eq!(path[0].nickname(), "Relay0");
        assert_eq!(path[3].nickname(), "Relay1");
        // terminal hop supports smtp, the others relay
        assert!(path[3].has_capability(Capability::Smtp));
        for hop in &path[..3] {
            assert!(hop.has_capability(Capability::Relay));
        }
        // no nickname appears twice
        let nicknames: HashSet<String> =
            path.iter().map(ServerDescriptor::lc_nickname).collect();
        assert_eq!(nicknames.len(), 4);
        Ok(())
    }

    #[test]
    fn test_hop_count_inference_and_mismatch() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let lock = ClientLock::new(&tmp.path().join("lock"));
        let dir = relay_pool(&test_state_dir(tmp.path()), &lock, 8)?;
        let mut rng = StdRng::seed_from_u64(3);

        // no wildcard: hop count comes from the path itself
        let (leg1, leg2) = parse_path(
            &dir,
            &mut rng,
            Some("Relay0,Relay1,Relay2"),
            None,
            None,
            None,
            SPAN_START,
            SPAN_END,
            false,
            None,
        )?;
        assert_eq!(leg1.len() + leg2.len(), 3);

        // wildcard with a default
        let (leg1, leg2) = parse_path(
            &dir, &mut rng, None, None, None, None, SPAN_START, SPAN_END, false,
            Some(5),
        )?;
        assert_eq!(leg1.len() + leg2.len(), 5);

        // explicit hops conflicting with a fixed path
        let err = parse_path(
            &dir,
            &mut rng,
            Some("Relay0,Relay1"),
            None,
            Some(3),
            None,
            SPAN_START,
            SPAN_END,
            false,
            None,
        )
        .unwrap_err();
        assert!(matches!(mix_err(&err), MixError::HopCountMismatch));

        // more named servers than requested hops
        let err = parse_path(
            &dir,
            &mut rng,
            Some("Relay0,Relay1,*,Relay2"),
            None,
            Some(2),
            None,
            SPAN_START,
            SPAN_END,
            false,
            None,
        )
        .unwrap_err();
        assert!(matches!(mix_err(&err), MixError::HopCountMismatch));
        Ok(())
    }

    #[test]
    fn test_small_pools_degrade() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(11);

        // two relays: tiled, no two adjacent hops equal
        let tmp = tempfile::tempdir()?;
        let lock = ClientLock::new(&tmp.path().join("lock"));
        let dir = relay_pool(&test_state_dir(tmp.path()), &lock, 2)?;
        let (leg1, leg2) = parse_path(
            &dir, &mut rng, None, None, Some(6), None, SPAN_START, SPAN_END,
            false, None,
        )?;
        let path: Vec<ServerDescriptor> =
            leg1.iter().chain(leg2.iter()).cloned().collect();
        assert_eq!(path.len(), 6);
        // the randomly-filled stretch alternates between the two relays
        // (the separately-chosen exit hop may collide with its neighbor)
        for pair in path[..5].windows(2) {
            assert_ne!(pair[0].lc_nickname(), pair[1].lc_nickname());
        }
        let nicknames: HashSet<String> =
            path.iter().map(ServerDescriptor::lc_nickname).collect();
        assert_eq!(nicknames.len(), 2);

        // a single relay gives a single-hop path, whatever was asked for
        let tmp = tempfile::tempdir()?;
        let lock = ClientLock::new(&tmp.path().join("lock"));
        let dir = relay_pool(&test_state_dir(tmp.path()), &lock, 1)?;
        let (leg1, leg2) = parse_path(
            &dir, &mut rng, None, None, Some(4), None, SPAN_START, SPAN_END,
            true, None,
        )?;
        assert_eq!(leg1.len() + leg2.len(), 2);

        // no relays at all
        let tmp = tempfile::tempdir()?;
        let lock = ClientLock::new(&tmp.path().join("lock"));
        let dir = relay_pool(&test_state_dir(tmp.path()), &lock, 0)?;
        let err = parse_path(
            &dir, &mut rng, None, None, Some(4), None, SPAN_START, SPAN_END,
            false, None,
        )
        .unwrap_err();
        assert!(matches!(mix_err(&err), MixError::NoRelaysKnown));
        Ok(())
    }

    #[test]
    fn test_reply_leg() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let lock = ClientLock::new(&tmp.path().join("lock"));
        let dir = relay_pool(&test_state_dir(tmp.path()), &lock, 8)?;
        let mut rng = StdRng::seed_from_u64(5);

        let address: Address = "mbox:joe@Relay1".parse()?;
        let leg = parse_path_leg(
            &dir,
            &mut rng,
            None,
            Some(&address),
            Some(3),
            SPAN_START,
            SPAN_END,
            None,
        )?;
        // the mandated exit is the last of the three hops
        assert_eq!(leg.len(), 3);
        assert_eq!(leg[2].nickname(), "Relay1");
        assert!(leg[2].has_capability(Capability::Mbox));
        // the two selected hops avoid the exit's nickname
        assert_ne!(leg[0].lc_nickname(), "relay1");
        assert_ne!(leg[1].lc_nickname(), "relay1");
        Ok(())
    }

    #[test]
    fn test_capability_postcheck() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let lock = ClientLock::new(&tmp.path().join("lock"));
        // Force a violation by naming an exit that is relay-only.
        let dir = crate::test_util::open_pool(
            &test_state_dir(tmp.path()),
            &lock,
            &[
                ("Relay0", &[Capability::Relay, Capability::Smtp, Capability::Mbox]),
                ("Relay1", &[Capability::Relay, Capability::Smtp, Capability::Mbox]),
                ("Relay2", &[Capability::Relay, Capability::Smtp, Capability::Mbox]),
                ("Bare", &[Capability::Relay]),
            ],
        )?;
        let mut rng = StdRng::seed_from_u64(9);

        let address: Address = "mbox:joe@Bare".parse()?;
        let err = parse_path(
            &dir,
            &mut rng,
            Some("Relay0,*"),
            Some(&address),
            Some(3),
            None,
            SPAN_START,
            SPAN_END,
            false,
            None,
        )
        .unwrap_err();
        assert!(matches!(
            mix_err(&err),
            MixError::CapabilityViolation { .. }
        ));
        Ok(())
    }
}
