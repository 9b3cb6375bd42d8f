use crate::prelude::*;
use std::fmt::Debug;

use console::{Style, StyledObject};
use tracing::{
    field::{Field, Visit},
    metadata::LevelFilter,
    span::Attributes,
    Event, Id, Level, Subscriber,
};
use tracing_subscriber::{
    filter::{EnvFilter, Targets},
    layer::{Context, Layer},
    prelude::*,
    registry::{LookupSpan, SpanRef},
};

use clap::{Args, ValueEnum};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ColorChoice {
    Auto,
    Always,
    Never,
}

#[derive(Args)]
pub struct OutputArgs {
    /// Increase verbosity. (Can be repeated.)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Reduce verbosity. (Can be repeated.)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    quiet: u8,
    #[arg(long, value_enum, default_value = "auto", value_name = "WHEN", global = true)]
    color: ColorChoice,
}

struct UiLayer;

struct WithMessage<'a, F>(&'a F)
where
    F: Fn(&dyn Debug);

impl<'a, F> Visit for WithMessage<'a, F>
where
    F: Fn(&dyn Debug),
{
    fn record_debug(&mut self, field: &Field, value: &dyn Debug) {
        if field.name() == "message" {
            (self.0)(value);
        }
    }
}

struct MessageAsString(String);

static WARNING: Lazy<StyledObject<&'static str>> =
    Lazy::new(|| Style::new().yellow().bold().for_stderr().apply_to("Warning:"));

static ERROR: Lazy<StyledObject<&'static str>> =
    Lazy::new(|| Style::new().red().bold().for_stderr().apply_to("Error:"));

fn collect_context<S>(leaf: Option<SpanRef<S>>) -> Vec<String>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    if let Some(leaf) = leaf {
        leaf.scope()
            .from_root()
            .filter_map(|span| {
                span.extensions()
                    .get::<MessageAsString>()
                    .map(|m| m.0.clone())
            })
            .collect()
    } else {
        vec![]
    }
}

pub fn current_context() -> Vec<String> {
    tracing::dispatcher::get_default(|dispatch| {
        if let Some(registry) = dispatch.downcast_ref::<tracing_subscriber::Registry>()
        {
            // NB: can't use Span::current_span() here, because that has to re-fetch the
            // current dispatcher, and while we're inside a dispatcher::get_default call
            // we temporarily *own* that dispatcher and the current dispatcher gets set
            // to None instead.
            if let Some(leaf_id) = registry.current_span().id() {
                return collect_context(registry.span(leaf_id));
            }
        }
        vec![]
    })
}

impl<S: Subscriber + for<'a> LookupSpan<'a>> Layer<S> for UiLayer {
    /// For every context!(...) span, render the message into a String and stash it
    /// inside the tracing_subscriber registry entry for this Span.
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let span = ctx.span(id).expect("span should already exist!");
        if span.metadata().target() == CONTEXT_TARGET {
            attrs.record(&mut WithMessage(&|msg| {
                let as_string = MessageAsString(format!("{:?}", msg));
                span.extensions_mut().insert(as_string);
            }));
        }
    }

    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        event.record(&mut WithMessage(&|msg| match *event.metadata().level() {
            Level::ERROR => eprintln!("{} {:?}", &*ERROR, msg),
            Level::WARN => eprintln!("{} {:?}", &*WARNING, msg),
            _ => eprintln!("{:?}", msg),
        }));
    }
}

pub const CONTEXT_TARGET: &str = "mixminion::context";
#[macro_export]
macro_rules! context {
    ($($arg:tt)*) => {
        let _guard = tracing::span!(target: "mixminion::context", tracing::Level::ERROR, "context", $($arg)*).entered();
    }
}

struct MixEyreHandler {
    context: Vec<String>,
}

impl MixEyreHandler {
    fn new() -> MixEyreHandler {
        MixEyreHandler {
            context: current_context(),
        }
    }
}

impl eyre::EyreHandler for MixEyreHandler {
    fn debug(
        &self,
        error: &(dyn std::error::Error + 'static),
        f: &mut core::fmt::Formatter<'_>,
    ) -> core::fmt::Result {
        write!(f, "{}", error)?;
        let mut source = error.source();
        while let Some(cause) = source {
            write!(f, "\n  caused by: {}", cause)?;
            source = cause.source();
        }
        if !self.context.is_empty() {
            write!(f, "\n  while: {}", self.context.join(" / "))?;
        }
        Ok(())
    }
}

/// Print a fatal error the way the UI layer prints error events.
pub fn report_error(err: &eyre::Report) {
    eprintln!("{} {:?}", &*ERROR, err);
}

pub fn init(args: &OutputArgs) {
    eyre::set_hook(Box::new(|_| Box::new(MixEyreHandler::new())))
        .expect("eyre handler already installed?");

    let verbosity = args
        .verbose
        .try_into()
        .unwrap_or(i8::MAX)
        .saturating_sub(args.quiet.try_into().unwrap_or(i8::MAX));

    let global_level = match verbosity {
        2.. => Level::TRACE,
        1 => Level::DEBUG,
        0 => Level::INFO,
        -1 => Level::WARN,
        // https://github.com/rust-lang/rust/issues/67264
        i8::MIN..=-2 => Level::ERROR,
    };

    match args.color {
        ColorChoice::Auto => (),
        ColorChoice::Always => console::set_colors_enabled_stderr(true),
        ColorChoice::Never => console::set_colors_enabled_stderr(false),
    }

    let s = tracing_subscriber::registry()
        .with(
            UiLayer.with_filter(Targets::new().with_target("mixminion", global_level)),
        )
        .with(
            tracing_subscriber::fmt::layer().with_filter(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::OFF.into())
                    .with_env_var("MIXMINION_DEBUG")
                    .from_env_lossy(),
            ),
        );
    s.init();
}
