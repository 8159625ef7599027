//! A handwritten parser for our arguments.
//!
//! The option surface is small and getopt-shaped: every long option is also
//! accepted with a short name, values may be attached (`-b/dir`,
//! `--base-dir=/dir`) or separate, and exactly one positional FILE argument
//! is required. Build scripts drive this tool, so the exact flag spellings
//! are load-bearing.

use crate::bail;
use crate::error::Result;
use crate::paths;
use std::path::PathBuf;

pub const HELP_TEXT: &str = "\
Usage: debugedit [OPTION...] FILE
  -b, --base-dir=STRING           base build directory of objects
  -d, --dest-dir=STRING           directory to rewrite base-dir into
  -l, --list-file=STRING          file where to put list of source and
                                  header file names
  -i, --build-id                  recompute build ID note and print ID on
                                  stdout
  -s, --build-id-seed=STRING      if recomputing the build ID note use
                                  this string as hash seed
  -n, --no-recompute-build-id     do not recompute build ID note even
                                  when -i or -s are given
  -p, --preserve-dates            Preserve modified/access timestamps

Help options:
  -?, --help                      Show this help message
  -u, --usage                     Display brief usage message
  -V, --version                   Show debugedit version";

pub const USAGE_TEXT: &str = "\
Usage: debugedit [-inp?] [-b|--base-dir STRING] [-d|--dest-dir STRING]
        [-l|--list-file STRING] [-i|--build-id]
        [-s|--build-id-seed STRING]
        [-n|--no-recompute-build-id]
        [-p|--preserve-dates]
        [-?|--help] [-u|--usage]
        [-V|--version] FILE";

#[derive(Debug, Default)]
pub struct Args {
    pub base_dir: Option<String>,
    pub dest_dir: Option<String>,
    pub list_file: Option<PathBuf>,
    pub build_id: bool,
    pub build_id_seed: Option<String>,
    pub no_recompute_build_id: bool,
    pub preserve_dates: bool,
    pub file: PathBuf,
}

#[derive(Debug)]
pub enum Action {
    Edit(Box<Args>),
    Version,
    Help,
    Usage,
}

impl Action {
    pub fn parse<S: AsRef<str>, I: Iterator<Item = S>>(args: I) -> Result<Action> {
        parse(args)
    }
}

fn parse<S: AsRef<str>, I: Iterator<Item = S>>(mut input: I) -> Result<Action> {
    let mut args = Args::default();
    let mut file = None;

    while let Some(arg) = input.next() {
        let arg = arg.as_ref();
        let mut value_for = |flag: &str, attached: Option<&str>| -> Result<String> {
            if let Some(value) = attached {
                return Ok(value.to_owned());
            }
            match input.next() {
                Some(value) => Ok(value.as_ref().to_owned()),
                None => bail!("Missing argument for {flag}"),
            }
        };

        match split_option(arg) {
            Some(("-b" | "--base-dir", attached)) => {
                args.base_dir = Some(value_for("--base-dir", attached)?);
            }
            Some(("-d" | "--dest-dir", attached)) => {
                args.dest_dir = Some(value_for("--dest-dir", attached)?);
            }
            Some(("-l" | "--list-file", attached)) => {
                args.list_file = Some(PathBuf::from(value_for("--list-file", attached)?));
            }
            Some(("-s" | "--build-id-seed", attached)) => {
                args.build_id_seed = Some(value_for("--build-id-seed", attached)?);
            }
            Some(("-i" | "--build-id", None)) => args.build_id = true,
            Some(("-n" | "--no-recompute-build-id", None)) => {
                args.no_recompute_build_id = true;
            }
            Some(("-p" | "--preserve-dates", None)) => args.preserve_dates = true,
            Some(("-V" | "--version", None)) => return Ok(Action::Version),
            Some(("-?" | "--help", None)) => return Ok(Action::Help),
            Some(("-u" | "--usage", None)) => return Ok(Action::Usage),
            Some((flag, _)) => bail!("Unrecognized option '{flag}'"),
            None => {
                if file.is_some() {
                    bail!("Need one FILE as input");
                }
                file = Some(PathBuf::from(arg));
            }
        }
    }

    let Some(file) = file else {
        bail!("Need one FILE as input");
    };
    args.file = file;

    if args.dest_dir.is_some() && args.base_dir.is_none() {
        bail!("You must specify a base dir if you specify a dest dir");
    }
    if args.build_id_seed.is_some() && !args.build_id {
        bail!("--build-id-seed (-s) needs --build-id (-i)");
    }
    if args.build_id_seed.as_deref() == Some("") {
        bail!("--build-id-seed (-s) string should be at least 1 char");
    }

    // Ensure clean paths, users can muck with these. Also removes any
    // trailing '/' from the paths.
    args.base_dir = args.base_dir.map(canonicalize);
    args.dest_dir = args.dest_dir.map(canonicalize);

    Ok(Action::Edit(Box::new(args)))
}

/// Splits an option into its flag and any `=`-attached or run-on short value.
/// Returns `None` for positional arguments.
fn split_option(arg: &str) -> Option<(&str, Option<&str>)> {
    if let Some(rest) = arg.strip_prefix("--") {
        if rest.is_empty() {
            return None;
        }
        return match rest.split_once('=') {
            Some((flag, value)) => Some((&arg[..flag.len() + 2], Some(value))),
            None => Some((arg, None)),
        };
    }
    if arg.len() > 1 && arg.starts_with('-') {
        if arg.len() > 2 {
            // Short option with attached value, getopt style.
            return Some((&arg[..2], Some(&arg[2..])));
        }
        return Some((arg, None));
    }
    None
}

fn canonicalize(path: String) -> String {
    String::from_utf8(paths::canonicalize_path(path.as_bytes()))
        .expect("canonicalization preserves UTF-8")
}
