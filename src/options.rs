//! # Sampling options
//!
//! The options are declared with clap but parsed permissively: options the
//! command does not know, stray positional tokens and values that fail
//! validation are dropped and the default applies. This lets callers pass a
//! shared argument vector or a loose option mapping without pre-filtering.
use clap::builder::{BoolishValueParser, RangedU64ValueParser};
use clap::{ArgAction, Command, CommandFactory, FromArgMatches, Parser};
use std::path::PathBuf;
use tracing::debug;

pub const DEFAULT_PROMPT: &str = "a painting of a virus monster playing guitar";

fn positive() -> RangedU64ValueParser<usize> {
    RangedU64ValueParser::new().range(1..)
}

#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "ldm-txt2img", author, version, about, long_about = None)]
#[command(args_override_self = true, allow_negative_numbers = true)]
pub struct Options {
    /// The prompt to render.
    #[arg(long, default_value = DEFAULT_PROMPT)]
    pub prompt: String,

    /// Directory to write results to.
    #[arg(long, value_name = "DIR", default_value = "outputs/txt2img-samples")]
    pub outdir: PathBuf,

    /// Number of sampling steps.
    #[arg(long = "ddim_steps", default_value_t = 200, value_parser = positive())]
    pub ddim_steps: usize,

    /// Use PLMS sampling, `--plms false` switches to DDIM.
    #[arg(
        long,
        action = ArgAction::Set,
        num_args = 0..=1,
        default_value_t = true,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new(),
    )]
    pub plms: bool,

    /// DDIM eta, 0.0 corresponds to deterministic sampling.
    #[arg(long = "ddim_eta", default_value_t = 0.0)]
    pub ddim_eta: f64,

    /// How many batches to sample.
    #[arg(long = "n_iter", default_value_t = 1, value_parser = positive())]
    pub n_iter: usize,

    /// Image height, in pixel space.
    #[arg(long = "H", default_value_t = 256, value_parser = clap::value_parser!(i64).range(8..))]
    pub height: i64,

    /// Image width, in pixel space.
    #[arg(long = "W", default_value_t = 256, value_parser = clap::value_parser!(i64).range(8..))]
    pub width: i64,

    /// How many samples to produce for the given prompt in each batch.
    #[arg(long = "n_samples", default_value_t = 1, value_parser = positive())]
    pub n_samples: usize,

    /// Unconditional guidance scale:
    /// eps = eps(x, empty) + scale * (eps(x, cond) - eps(x, empty))
    #[arg(long, default_value_t = 5.0)]
    pub scale: f64,

    /// The model descriptor.
    #[arg(long, value_name = "FILE", default_value = "configs/latent-diffusion/txt2img-sd-v1.json")]
    pub config: PathBuf,

    /// The checkpoint holding the trained weights.
    #[arg(long, value_name = "FILE", default_value = "models/ldm/text2img-large/model.safetensors")]
    pub ckpt: PathBuf,

    /// When set, use the CPU even if an accelerator is available.
    #[arg(long)]
    pub cpu: bool,

    /// Seed for the random number generator.
    #[arg(long)]
    pub seed: Option<i64>,
}

impl Default for Options {
    fn default() -> Self {
        Self::parse_from([Self::command().get_name()])
    }
}

impl Options {
    /// Parses an argument vector, the first element being the program name.
    pub fn from_args<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let mut command = Self::command();
        command.build();
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        let retained = retain_known(&command, &args);
        let matches = command.try_get_matches_from(retained)?;
        Self::from_arg_matches(&matches)
    }

    /// Parses an in-memory mapping from option names, e.g. `n_iter`, to values.
    pub fn from_map<I, K, V>(options: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: ToString,
    {
        let program = Self::command().get_name().to_string();
        let args = std::iter::once(program).chain(
            options
                .into_iter()
                .map(|(key, value)| format!("--{}={}", key.as_ref(), value.to_string())),
        );
        Self::from_args(args)
    }
}

fn truthy(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on" | "y")
}

fn accepts(command: &Command, name: &str, value: &str) -> bool {
    command
        .clone()
        .try_get_matches_from([command.get_name().to_string(), format!("--{name}={value}")])
        .is_ok()
}

// Rewrites the arguments as `--name=value` tokens, keeping only the ones
// that would parse on their own.
fn retain_known(command: &Command, args: &[String]) -> Vec<String> {
    let mut args = args.iter().peekable();
    let mut retained: Vec<String> = args.next().cloned().into_iter().collect();
    while let Some(token) = args.next() {
        let Some(option) = token.strip_prefix("--") else {
            debug!("ignoring stray argument {token:?}");
            continue;
        };
        let (name, inline_value) = match option.split_once('=') {
            Some((name, value)) => (name, Some(value.to_string())),
            None => (option, None),
        };
        let Some(arg) = command.get_arguments().find(|arg| arg.get_long() == Some(name)) else {
            debug!("ignoring unknown option --{name}");
            continue;
        };
        if !arg.get_action().takes_values() {
            if inline_value.as_deref().map_or(true, truthy) {
                retained.push(format!("--{name}"));
            }
            continue;
        }
        let optional = arg.get_num_args().map_or(false, |n| n.min_values() == 0);
        let value = match inline_value {
            Some(value) => Some(value),
            None => match args.peek() {
                Some(next)
                    if !next.starts_with("--") && (!optional || accepts(command, name, next)) =>
                {
                    args.next().cloned()
                }
                _ => None,
            },
        };
        match value {
            Some(value) if accepts(command, name, &value) => {
                retained.push(format!("--{name}={value}"))
            }
            Some(value) => debug!("ignoring invalid value {value:?} for --{name}"),
            None if optional => retained.push(format!("--{name}")),
            None => debug!("ignoring --{name} without a value"),
        }
    }
    retained
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Options {
        let args = std::iter::once("ldm-txt2img").chain(args.iter().copied());
        Options::from_args(args).unwrap()
    }

    #[test]
    fn defaults() {
        let options = parse(&[]);
        assert_eq!(options.n_iter, 1);
        assert_eq!(options.n_samples, 1);
        assert_eq!(options.ddim_steps, 200);
        assert_eq!(options.scale, 5.0);
        assert_eq!(options.ddim_eta, 0.0);
        assert_eq!((options.height, options.width), (256, 256));
        assert!(options.plms);
        assert_eq!(options.prompt, DEFAULT_PROMPT);
        assert_eq!(options.outdir, PathBuf::from("outputs/txt2img-samples"));
        assert_eq!(options.seed, None);
        assert_eq!(options, Options::default());
    }

    #[test]
    fn unknown_options_are_ignored() {
        let options = parse(&["--foo", "bar", "--n_iter", "3", "stray", "--verbose"]);
        assert_eq!(options.n_iter, 3);
    }

    #[test]
    fn malformed_values_fall_back_to_defaults() {
        let options =
            parse(&["--n_iter", "abc", "--n_samples", "0", "--scale", "big", "--H", "4", "--W"]);
        assert_eq!(options.n_iter, 1);
        assert_eq!(options.n_samples, 1);
        assert_eq!(options.scale, 5.0);
        assert_eq!((options.height, options.width), (256, 256));
    }

    #[test]
    fn plms_flag() {
        assert!(parse(&["--plms"]).plms);
        assert!(parse(&["--plms", "true"]).plms);
        assert!(!parse(&["--plms", "false"]).plms);
        let options = parse(&["--plms", "--n_iter", "2"]);
        assert!(options.plms);
        assert_eq!(options.n_iter, 2);
    }

    #[test]
    fn last_occurrence_wins() {
        let options = parse(&["--n_iter", "2", "--n_iter=5", "--ddim_eta", "-0.5"]);
        assert_eq!(options.n_iter, 5);
        assert_eq!(options.ddim_eta, -0.5);
    }

    #[test]
    fn mapping() {
        let options = Options::from_map([
            ("prompt", "--a dashing prompt".to_string()),
            ("n_iter", "4".to_string()),
            ("plms", "false".to_string()),
            ("cpu", "true".to_string()),
            ("not_an_option", "1".to_string()),
        ])
        .unwrap();
        assert_eq!(options.prompt, "--a dashing prompt");
        assert_eq!(options.n_iter, 4);
        assert!(!options.plms);
        assert!(options.cpu);
        assert_eq!(options.n_samples, 1);
    }

    #[test]
    fn mapping_with_numbers() {
        let options = Options::from_map([("n_samples", 3), ("seed", 42), ("W", 512)]).unwrap();
        assert_eq!(options.n_samples, 3);
        assert_eq!(options.seed, Some(42));
        assert_eq!(options.width, 512);

        let options = Options::from_map([("scale", 7.5), ("n_iter", 2.5)]).unwrap();
        assert_eq!(options.scale, 7.5);
        assert_eq!(options.n_iter, 1);
    }

    #[test]
    fn disabled_flag_in_mapping() {
        let options = Options::from_map([("cpu", "false")]).unwrap();
        assert!(!options.cpu);
    }
}
