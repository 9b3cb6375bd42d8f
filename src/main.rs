#![forbid(unsafe_code)]

mod address;
mod client;
mod config;
mod crypto;
mod descriptor;
mod directory;
mod error;
mod keyring;
mod lock;
mod output;
mod packet;
mod pathspec;
mod prelude;
mod spool;
mod surblog;
mod transport;
mod util;

#[cfg(test)]
mod test_util;

use crate::address::{Address, DROP_TYPE};
use crate::client::{MixClient, QueuePolicy};
use crate::config::ClientConfig;
use crate::crypto::ClientRng;
use crate::directory::{ClientDirectory, DEFAULT_REQUIRED_LIFETIME};
use crate::keyring::TermPrompt;
use crate::lock::ClientLock;
use crate::packet::ReplyBlock;
use crate::prelude::*;
use crate::transport::TcpTransport;
use crate::util::{create_private_dir, succeeding_midnight};

use clap::{Args, Parser, Subcommand};
use std::fs;
use std::io::IsTerminal;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "mixminion", version, about = "Type III anonymous remailer client")]
struct Cli {
    #[command(flatten)]
    output: output::OutputArgs,
    /// Use a configuration file other than ~/.mixminionrc.
    /// (You can also set MIXMINIONRC.)
    #[arg(short = 'f', long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

fn parse_yes_no(value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "yes" | "true" | "y" | "t" | "force" => Ok(true),
        "0" | "no" | "false" | "n" | "f" => Ok(false),
        _ => Err(format!("expected 'yes' or 'no', not {:?}", value)),
    }
}

#[derive(Args)]
struct DownloadArgs {
    /// Force the client to download (or not download) a fresh directory.
    #[arg(
        short = 'D',
        long = "download-directory",
        value_name = "yes|no",
        value_parser = parse_yes_no
    )]
    download: Option<bool>,
}

#[derive(Args)]
struct PathArgs {
    /// Specify an explicit message path.
    #[arg(short = 'P', long, value_name = "PATH")]
    path: Option<String>,
    /// Force the path to use this many hops.
    #[arg(short = 'H', long, value_name = "N")]
    hops: Option<usize>,
}

#[derive(Args)]
struct SendArgs {
    #[command(flatten)]
    download: DownloadArgs,
    #[command(flatten)]
    path: PathArgs,
    /// The recipient's address.
    #[arg(short = 't', long, value_name = "ADDRESS")]
    to: Option<String>,
    /// Read reply blocks from FILE and use them as the second leg.
    #[arg(short = 'R', long = "reply-block", value_name = "FILE")]
    reply_block: Option<PathBuf>,
    /// Specify an explicit swap point (1-based hop index).
    #[arg(long = "swap-at", value_name = "N")]
    swap_at: Option<usize>,
    /// Read the message to send from FILE. (Defaults to standard input.)
    #[arg(short = 'i', long, value_name = "FILE")]
    input: Option<PathBuf>,
    /// Queue the message instead of sending it now.
    #[arg(long)]
    pool: bool,
    /// Never queue the message, even if delivery fails.
    #[arg(long, conflicts_with = "pool")]
    no_pool: bool,
}

#[derive(Args)]
struct DecodeArgs {
    /// Read the armored message from FILE ('-' for standard input).
    #[arg(short = 'i', long, value_name = "FILE")]
    input: String,
    /// Write the results to FILE rather than standard output.
    #[arg(short = 'o', long, value_name = "FILE", default_value = "-")]
    output: String,
    /// Decode the input even if it seems overcompressed.
    #[arg(short = 'F', long)]
    force: bool,
}

#[derive(Args)]
struct GenerateSurbArgs {
    #[command(flatten)]
    download: DownloadArgs,
    #[command(flatten)]
    path: PathArgs,
    /// The address replies should reach.  (Defaults to Security.SURBAddress.)
    #[arg(short = 't', long, value_name = "ADDRESS")]
    to: Option<String>,
    /// Reply-block lifetime, in days.
    #[arg(long, value_name = "DAYS")]
    lifetime: Option<u32>,
    /// Write the results to FILE rather than standard output.
    #[arg(short = 'o', long, value_name = "FILE", default_value = "-")]
    output: String,
    /// Write raw binary reply blocks instead of ascii armor.
    #[arg(short = 'b', long)]
    binary: bool,
    /// How many reply blocks to generate.
    #[arg(short = 'n', long, default_value_t = 1)]
    count: u32,
}

#[derive(Subcommand)]
enum Command {
    /// Send a message through the mix network.
    Send(SendArgs),
    /// Queue a message for delivery at the next flush.
    Pool(SendArgs),
    /// Import server descriptors from files.
    ImportServer {
        #[arg(required = true, value_name = "FILE")]
        files: Vec<PathBuf>,
    },
    /// List the known servers and their capabilities.
    ListServers(DownloadArgs),
    /// Download a fresh server directory.
    UpdateServers,
    /// Decode messages received from the mix network.
    Decode(DecodeArgs),
    /// Generate single-use reply blocks.
    GenerateSurb(GenerateSurbArgs),
    /// Describe reply blocks stored in files.
    InspectSurbs {
        #[arg(required = true, value_name = "FILE")]
        files: Vec<PathBuf>,
    },
    /// Try to deliver every queued packet.
    FlushPool,
    /// Summarize the packet queue.
    ListPool,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // help and version go to stdout and exit 0; real usage errors
            // print and exit 1
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };
    output::init(&cli.output);
    if let Err(err) = run(cli) {
        output::report_error(&err);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = ClientConfig::load(cli.config.as_deref())?;
    let session = Session::new(config)?;
    match cli.command {
        Command::Send(args) => cmd_send(&session, args, false),
        Command::Pool(args) => cmd_send(&session, args, true),
        Command::ImportServer { files } => cmd_import_server(&session, &files),
        Command::ListServers(download) => cmd_list_servers(&session, download),
        Command::UpdateServers => cmd_update_servers(&session),
        Command::Decode(args) => cmd_decode(&session, args),
        Command::GenerateSurb(args) => cmd_generate_surb(&session, args),
        Command::InspectSurbs { files } => cmd_inspect_surbs(&files),
        Command::FlushPool => cmd_flush_pool(&session),
        Command::ListPool => cmd_list_pool(&session),
    }
}

/// Everything a command needs from the environment: the parsed config, the
/// state directory, its lock, and an HTTP agent.
struct Session {
    config: ClientConfig,
    lock: ClientLock,
    agent: ureq::Agent,
}

impl Session {
    fn new(config: ClientConfig) -> Result<Session> {
        let userdir = config.user_dir();
        create_private_dir(&userdir)?;
        let lock = ClientLock::new(&userdir.join("lock"));
        let agent = ureq::AgentBuilder::new()
            .timeout_read(config.connection_timeout())
            .timeout_write(config.connection_timeout())
            .timeout_connect(Duration::from_secs(30))
            .build();
        Ok(Session {
            config,
            lock,
            agent,
        })
    }

    fn directory(&self) -> Result<ClientDirectory<'_>> {
        debug!("Configuring server list");
        ClientDirectory::open(&self.config.user_dir(), &self.lock, self.agent.clone())
    }

    fn client(&self) -> Result<MixClient<'_, TcpTransport>> {
        debug!("Configuring client");
        MixClient::new(&self.config, &self.lock, TcpTransport)
    }

    fn rng(&self) -> Result<ClientRng> {
        ClientRng::from_config(self.config.entropy_source().as_deref())
    }

    /// Apply a -D/--download-directory flag: yes forces a download, no
    /// suppresses it, absent means "if stale".
    fn maybe_update(
        &self,
        dir: &mut ClientDirectory<'_>,
        download: &DownloadArgs,
    ) -> Result<()> {
        if download.download == Some(false) {
            return Ok(());
        }
        let _guard = self.lock.acquire()?;
        dir.update_directory(download.download == Some(true), OffsetDateTime::now_utc())
    }
}

fn read_payload(input: Option<&Path>) -> Result<Vec<u8>> {
    match input {
        Some(path) => fs::read(path)
            .wrap_err_with(|| format!("could not read message from {}", path.display())),
        None => {
            if std::io::stdin().is_terminal() {
                eprintln!("Enter your message now.  Type Ctrl-D when you are done.");
            }
            slurp(&mut std::io::stdin())
        }
    }
}

fn read_reply_blocks(path: &Path) -> Result<Vec<ReplyBlock>> {
    let raw = fs::read(path)
        .wrap_err_with(|| format!("could not read reply blocks from {}", path.display()))?;
    if let Ok(text) = std::str::from_utf8(&raw) {
        if text.contains(packet::REPLY_BLOCK_BEGIN) {
            return packet::parse_text_reply_blocks(text)
                .wrap_err_with(|| format!("error parsing {}", path.display()));
        }
    }
    packet::parse_reply_blocks(&raw)
        .wrap_err_with(|| format!("error parsing {}", path.display()))
}

fn open_output(target: &str) -> Result<Box<dyn Write>> {
    if target == "-" {
        Ok(Box::new(std::io::stdout()))
    } else {
        Ok(Box::new(fs::File::create(target).wrap_err_with(|| {
            format!("could not open output file {}", target)
        })?))
    }
}

fn cmd_send(session: &Session, args: SendArgs, pool_mode: bool) -> Result<()> {
    if pool_mode && args.no_pool {
        bail!("can't use --no-pool with the pool command");
    }
    let policy = if pool_mode || args.pool {
        QueuePolicy::SpoolOnly
    } else if args.no_pool {
        QueuePolicy::Never
    } else {
        QueuePolicy::SpoolFirst
    };

    let (address, surbs): (Option<Address>, Option<Vec<ReplyBlock>>) =
        match (&args.to, &args.reply_block) {
            (Some(_), Some(_)) => {
                bail!("cannot use both a recipient and a reply block")
            }
            (None, None) => bail!("no recipients specified"),
            (Some(to), None) => (Some(to.parse()?), None),
            (None, Some(path)) => (None, Some(read_reply_blocks(path)?)),
        };

    let mut dir = session.directory()?;
    session.maybe_update(&mut dir, &args.download)?;
    let mut rng = session.rng()?;
    let mut client = session.client()?;

    let now = OffsetDateTime::now_utc();
    let end = now + DEFAULT_REQUIRED_LIFETIME;
    let default_hops = Some(session.config.security.path_length);
    let swap_at = args.swap_at.map(|n| n as isize - 1);

    match surbs {
        None => {
            let address = address.ok_or_else(|| eyre!("no recipients specified"))?;
            let (leg1, leg2) = pathspec::parse_path(
                &dir,
                &mut rng,
                args.path.path.as_deref(),
                Some(&address),
                args.path.hops,
                swap_at,
                now,
                end,
                false,
                default_hops,
            )?;
            info!(
                "Selected path is {}:{}",
                pathspec::join_nicknames(&leg1),
                pathspec::join_nicknames(&leg2),
            );

            let payload = if address.exit_type() == DROP_TYPE {
                if args.input.is_some() {
                    bail!("cannot send a payload with a DROP message");
                }
                info!("Sending dummy message");
                None
            } else {
                Some(read_payload(args.input.as_deref())?)
            };
            client.send_forward(
                &mut rng,
                &address,
                payload.as_deref(),
                &leg1,
                &leg2,
                policy,
            )
        }
        Some(surbs) => {
            if args.swap_at.is_some() {
                bail!("cannot choose a swap point when replying");
            }
            let leg1 = pathspec::parse_path_leg(
                &dir,
                &mut rng,
                args.path.path.as_deref(),
                None,
                args.path.hops,
                now,
                end,
                default_hops,
            )?;
            info!(
                "Selected path is {}:<reply block>",
                pathspec::join_nicknames(&leg1),
            );
            let payload = read_payload(args.input.as_deref())?;
            client.send_reply(&mut rng, &payload, &leg1, &surbs, policy, now)
        }
    }
}

fn cmd_import_server(session: &Session, files: &[PathBuf]) -> Result<()> {
    let mut dir = session.directory()?;
    let _guard = session.lock.acquire()?;
    for path in files {
        println!("Importing from {}", path.display());
        if let Err(e) = dir.import_from_file(path) {
            println!("Error while importing: {:#}", e);
        }
    }
    println!("Done.");
    Ok(())
}

fn cmd_list_servers(session: &Session, download: DownloadArgs) -> Result<()> {
    let mut dir = session.directory()?;
    session.maybe_update(&mut dir, &download)?;
    for line in dir.list_servers() {
        println!("{}", line);
    }
    Ok(())
}

fn cmd_update_servers(session: &Session) -> Result<()> {
    let mut dir = session.directory()?;
    let _guard = session.lock.acquire()?;
    dir.update_directory(true, OffsetDateTime::now_utc())?;
    println!("Directory updated");
    Ok(())
}

fn cmd_decode(session: &Session, args: DecodeArgs) -> Result<()> {
    let text = if args.input == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        fs::read_to_string(&args.input)
            .wrap_err_with(|| format!("could not read file {}", args.input))?
    };

    let mut client = session.client()?;
    let results = client.decode_message(&text, args.force, &mut TermPrompt)?;

    let mut out = open_output(&args.output)?;
    for result in results {
        out.write_all(&result)?;
    }
    out.flush()?;
    Ok(())
}

fn cmd_generate_surb(session: &Session, args: GenerateSurbArgs) -> Result<()> {
    let address: Address = match args
        .to
        .as_deref()
        .or(session.config.security.surb_address.as_deref())
    {
        Some(to) => to.parse()?,
        None => bail!("no recipient specified; use --to or set Security.SURBAddress"),
    };

    let mut dir = session.directory()?;
    session.maybe_update(&mut dir, &args.download)?;
    let mut rng = session.rng()?;
    let mut client = session.client()?;
    let mut prompt = TermPrompt;

    let now = OffsetDateTime::now_utc();
    let lifetime = match args.lifetime {
        Some(days) => time::Duration::days(days.into()),
        None => session.config.surb_lifetime(),
    };
    let end_time = succeeding_midnight(now + lifetime);
    let default_hops = Some(session.config.security.surb_path_length);

    let mut out = open_output(&args.output)?;
    for _ in 0..args.count {
        // a fresh path for every block
        let leg = pathspec::parse_path_leg(
            &dir,
            &mut rng,
            args.path.path.as_deref(),
            Some(&address),
            args.path.hops,
            now,
            end_time,
            default_hops,
        )?;
        info!("Selected path is {}", pathspec::join_nicknames(&leg));
        let surb =
            client.generate_reply_block(&mut rng, &mut prompt, &address, &leg, end_time)?;
        if args.binary {
            out.write_all(&surb.pack())?;
        } else {
            out.write_all(surb.pack_text().as_bytes())?;
        }
    }
    out.flush()?;
    Ok(())
}

fn cmd_inspect_surbs(files: &[PathBuf]) -> Result<()> {
    for path in files {
        println!("==== {}", path.display());
        match read_reply_blocks(path) {
            Ok(surbs) => {
                for surb in surbs {
                    println!("{}", surb.describe());
                }
            }
            Err(e) => println!("Error while parsing: {:#}", e),
        }
    }
    Ok(())
}

fn cmd_flush_pool(session: &Session) -> Result<()> {
    let mut client = session.client()?;
    client.flush_spool()
}

fn cmd_list_pool(session: &Session) -> Result<()> {
    let client = session.client()?;
    let rows = client.inspect_spool(OffsetDateTime::now_utc())?;
    if rows.is_empty() {
        println!("No packets queued");
        return Ok(());
    }
    for row in rows {
        println!(
            "{:2} packets for server at {} (oldest is {} days old)",
            row.count,
            row.first_hop,
            row.age(),
        );
    }
    Ok(())
}
