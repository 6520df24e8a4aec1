//! CLI option parsing.
//!
//! See [man ld](https://man7.org/linux/man-pages/man1/ld.1.html).
//!
//! ld opts are very whack and weird, so we use no CLI parsing framework
//! or library because they'd probably do it wrong!
//!
//! Bless the linker writers of the past for the mess they have constructed.

use std::path::PathBuf;

use anyhow::bail;

#[derive(Debug)]
pub struct InputFile {
    pub name: PathBuf,
}

struct Opt {
    short: Option<char>,
    long: &'static str,
    takes_value: Option<fn(&mut Opts, value: String)>,
    set: fn(&mut Opts),
}

macro_rules! define_opts {
    ($(
        $field:ident: $long:literal $(, $short:literal)? $(, $value:ident)? ;
    )*) => {
        #[derive(Debug, Default)]
        pub struct Opts {
            $(
                pub $field: Option<String>,
            )*
        }

        const OPTS: &[Opt] = &[
            $(
                Opt {
                    short: short_opt!($($short)?),
                    long: $long,
                    takes_value: takes_value!($field, $($value)?),
                    set: set!($field, $($value)?)
                },
            )*
        ];
    };
}

macro_rules! short_opt {
    () => {
        None
    };
    ($opt:tt) => {
        Some($opt)
    };
}

macro_rules! takes_value {
    ($field:ident, ) => {
        None
    };
    ($field:ident, $opt:tt) => {
        Some(|opts, value| opts.$field = Some(value))
    };
}

macro_rules! set {
    ($field:ident, ) => {
        |opts| opts.$field = true;
    };
    ($field:ident, $opt:tt) => {
        |_| {
            unreachable!(
                "set called on option taking a value: {}",
                stringify!($field)
            )
        }
    };
}

define_opts! {
    entry: "entry", 'e', String;
    output: "output", 'o', String;
    image_base: "image-base", String;
    soname: "soname", String;
    dynamic_linker: "dynamic-linker", String;
    version_script: "version-script", String;
    dynamic_list: "dynamic-list", String;
    section_alignment: "section-alignment", String;
    oformat: "oformat", String;
    stack: "stack", String;
    heap: "heap", String;
}

macro_rules! define_flags {
    ($($field:ident: $long:literal;)*) => {
        #[derive(Debug, Default)]
        pub struct Flags {
            $(pub $field: bool,)*
        }
    };
}

define_flags! {
    shared: "shared";
    pie: "pie";
    relocatable: "relocatable";
    gc_sections: "gc-sections";
    export_dynamic: "export-dynamic";
    allow_shlib_undefined: "allow-shlib-undefined";
    no_undefined: "no-undefined";
    allow_multiple_definition: "allow-multiple-definition";
    nostdlib: "nostdlib";
    as_needed: "as-needed";
    build_id: "build-id";
    noinhibit_exec: "noinhibit-exec";
    force_unresolved: "force-unresolved";
    no_bind: "no-bind";
    no_isolation: "no-isolation";
    no_relocations: "no-base-relocations";
}

const FLAG_NAMES: &[&str] = &[
    "shared",
    "pie",
    "relocatable",
    "gc-sections",
    "export-dynamic",
    "allow-shlib-undefined",
    "no-undefined",
    "allow-multiple-definition",
    "nostdlib",
    "as-needed",
    "build-id",
    "noinhibit-exec",
    "force-unresolved",
    "no-bind",
    "no-isolation",
    "no-base-relocations",
];

fn set_flag(flags: &mut Flags, name: &str) {
    match name {
        "shared" => flags.shared = true,
        "pie" => flags.pie = true,
        "relocatable" => flags.relocatable = true,
        "gc-sections" => flags.gc_sections = true,
        "export-dynamic" => flags.export_dynamic = true,
        "allow-shlib-undefined" => flags.allow_shlib_undefined = true,
        "no-undefined" => flags.no_undefined = true,
        "allow-multiple-definition" => flags.allow_multiple_definition = true,
        "nostdlib" => flags.nostdlib = true,
        "as-needed" => flags.as_needed = true,
        "build-id" => flags.build_id = true,
        "noinhibit-exec" => flags.noinhibit_exec = true,
        "force-unresolved" => flags.force_unresolved = true,
        "no-bind" => flags.no_bind = true,
        "no-isolation" => flags.no_isolation = true,
        "no-base-relocations" => flags.no_relocations = true,
        _ => unreachable!(),
    }
}

/// Multi-valued/`ld`-style repeated options that don't fit `define_opts!`'s
/// one-value-per-field model (`-l`/`-L`/`-u`/`--defsym`, each of which can
/// appear any number of times on one command line).
#[derive(Debug, Default)]
pub struct Lists {
    pub library_paths: Vec<PathBuf>,
    pub libraries: Vec<String>,
    pub undefined: Vec<String>,
    pub include: Vec<String>,
    pub defsyms: Vec<String>,
    pub rpath: Vec<String>,
    pub wrap: Vec<String>,
    pub alternate_names: Vec<String>,
}

pub fn parse(mut args: impl Iterator<Item = String>) -> anyhow::Result<(Opts, Flags, Lists, Vec<InputFile>)> {
    let mut opts = Opts::default();
    let mut flags = Flags::default();
    let mut lists = Lists::default();
    let mut files = Vec::new();
    let mut require_value: Option<fn(&mut Opts, String)> = None;

    while let Some(arg) = args.next() {
        if arg.starts_with("@") {
            bail!("@file parsing syntax is not implemented yet.");
        } else if let Some(apply_value) = require_value {
            apply_value(&mut opts, arg);
            require_value = None;
        } else if let Some(rest) = arg.strip_prefix("-L") {
            lists.library_paths.push(if rest.is_empty() {
                args.next().ok_or_else(|| anyhow::anyhow!("-L requires a value"))?.into()
            } else {
                rest.into()
            });
        } else if let Some(rest) = arg.strip_prefix("-l") {
            lists.libraries.push(if rest.is_empty() {
                args.next().ok_or_else(|| anyhow::anyhow!("-l requires a value"))?
            } else {
                rest.to_owned()
            });
        } else if arg == "-u" || arg == "--undefined" {
            lists.undefined.push(args.next().ok_or_else(|| anyhow::anyhow!("{arg} requires a value"))?);
        } else if let Some(rest) = arg.strip_prefix("--undefined=") {
            lists.undefined.push(rest.to_owned());
        } else if arg == "--require-defined" {
            lists.include.push(args.next().ok_or_else(|| anyhow::anyhow!("{arg} requires a value"))?);
        } else if arg == "--defsym" {
            lists.defsyms.push(args.next().ok_or_else(|| anyhow::anyhow!("{arg} requires a value"))?);
        } else if let Some(rest) = arg.strip_prefix("--defsym=") {
            lists.defsyms.push(rest.to_owned());
        } else if arg == "-rpath" || arg == "--rpath" || arg == "-R" {
            lists.rpath.push(args.next().ok_or_else(|| anyhow::anyhow!("{arg} requires a value"))?);
        } else if arg == "--wrap" {
            lists.wrap.push(args.next().ok_or_else(|| anyhow::anyhow!("{arg} requires a value"))?);
        } else if let Some(rest) = arg.strip_prefix("--wrap=") {
            lists.wrap.push(rest.to_owned());
        } else if arg == "--alternate-name" {
            lists
                .alternate_names
                .push(args.next().ok_or_else(|| anyhow::anyhow!("{arg} requires a value"))?);
        } else if let Some(rest) = arg.strip_prefix("--alternate-name=") {
            lists.alternate_names.push(rest.to_owned());
        } else if let Some(long) = arg.strip_prefix("--").filter(|l| FLAG_NAMES.contains(l)) {
            set_flag(&mut flags, long);
        } else if arg.starts_with("-") {
            let Some(first_c) = arg.chars().nth(1) else {
                bail!("option starting with - requires a value. stdin/stdout are not supported");
            };

            // We first need to check for long opts, as -entry should be parsed as --entry and not -e ntry.
            // Accept both double -- and single -.
            let long_start = if first_c == '-' { 2 } else { 1 };
            let long_end = arg.chars().position(|c| c == '=').unwrap_or(arg.len());
            let long_flag_name = &arg[long_start..long_end];
            if let Some(long) = OPTS
                .iter()
                // Important: any long options starting with -o MUST NOT be parsed as the long options if starting
                // with a single dash. Just -o. No other flag.
                .find(|o| {
                    let skip_because_of_o = long_flag_name.starts_with("o") && first_c != '-';
                    !skip_because_of_o && o.long == long_flag_name
                })
            {
                if let Some(takes_value) = long.takes_value {
                    if long_end != arg.len() {
                        let value = &arg[(long_end + 1)..];
                        takes_value(&mut opts, value.to_owned());
                    } else {
                        require_value = Some(takes_value);
                    }
                } else if long_end != arg.len() {
                    bail!("long option {arg} does not take a value");
                } else {
                    (long.set)(&mut opts);
                }
                // We successfully parsed this as a long option, great. Move on.
                continue;
            }

            // No long option. Try short opts instead.
            if let Some(short) = OPTS.iter().find(|o| o.short == Some(first_c)) {
                if let Some(takes_value) = short.takes_value {
                    if long_flag_name.len() > 1 {
                        let value = &long_flag_name[1..];
                        takes_value(&mut opts, value.to_owned());
                    } else {
                        require_value = Some(takes_value);
                    }
                } else if arg.len() > 2 {
                    bail!("short option {arg} does not take a value");
                } else {
                    (short.set)(&mut opts);
                }
                // It's a short option!
                continue;
            }

            // No options exist :(
            bail!("unrecognized option: {arg}");
        } else {
            files.push(InputFile { name: arg.into() });
        }
    }

    if require_value.is_some() {
        bail!("last option required a value but none was supplied");
    }

    Ok((opts, flags, lists, files))
}

#[cfg(test)]
mod tests {
    use super::{Flags, InputFile, Lists, Opts};

    fn parse(cmd: impl AsRef<[&'static str]>) -> anyhow::Result<(Opts, Flags, Lists, Vec<InputFile>)> {
        super::parse(cmd.as_ref().into_iter().map(|&s| s.to_owned()))
    }

    #[test]
    fn value_has_dashes() {
        let cmd = ["--output", "--meow"];
        let (opts, _, _, files) = parse(cmd).unwrap();
        assert_eq!(opts.output, Some("--meow".to_owned()));
        assert!(files.is_empty());
    }

    #[test]
    fn short_value_direct() {
        let cmd = ["-estart"];
        let (opts, ..) = parse(cmd).unwrap();
        assert_eq!(opts.entry, Some("start".to_owned()));
    }

    #[test]
    fn short_value_2() {
        let cmd = ["-e", "start"];
        let (opts, ..) = parse(cmd).unwrap();
        assert_eq!(opts.entry, Some("start".to_owned()));
    }

    #[test]
    fn single_dash_long_value_eq() {
        let cmd = ["-entry=start"];
        let (opts, ..) = parse(cmd).unwrap();
        assert_eq!(opts.entry, Some("start".to_owned()));
    }

    #[test]
    fn single_dash_long_value_2() {
        let cmd = ["-entry", "start"];
        let (opts, ..) = parse(cmd).unwrap();
        assert_eq!(opts.entry, Some("start".to_owned()));
    }

    #[test]
    fn long_value_eq() {
        let cmd = ["--entry=start"];
        let (opts, ..) = parse(cmd).unwrap();
        assert_eq!(opts.entry, Some("start".to_owned()));
    }

    #[test]
    fn long_value_2() {
        let cmd = ["--entry", "start"];
        let (opts, ..) = parse(cmd).unwrap();
        assert_eq!(opts.entry, Some("start".to_owned()));
    }

    #[test]
    fn bad_option() {
        let cmd = ["--meow"];
        parse(cmd).unwrap_err();
    }

    #[test]
    fn library_flags_accumulate() {
        let cmd = ["-lm", "-L", "/usr/lib", "-lc", "-Lother/dir"];
        let (_, _, lists, _) = parse(cmd).unwrap();
        assert_eq!(lists.libraries, vec!["m", "c"]);
        assert_eq!(lists.library_paths, vec![std::path::PathBuf::from("/usr/lib"), "other/dir".into()]);
    }

    #[test]
    fn shared_and_gc_sections_flags() {
        let cmd = ["--shared", "--gc-sections"];
        let (_, flags, ..) = parse(cmd).unwrap();
        assert!(flags.shared);
        assert!(flags.gc_sections);
    }

    #[test]
    fn undefined_and_defsym_accumulate() {
        let cmd = ["-u", "foo", "--defsym=bar=0x10"];
        let (_, _, lists, _) = parse(cmd).unwrap();
        assert_eq!(lists.undefined, vec!["foo".to_owned()]);
        assert_eq!(lists.defsyms, vec!["bar=0x10".to_owned()]);
    }

    #[test]
    fn no_value_supplied_end() {
        let cmd = ["-e"];
        parse(cmd).unwrap_err();
    }

    #[test]
    fn wrap_accumulates() {
        let cmd = ["--wrap", "malloc", "--wrap=free"];
        let (_, _, lists, _) = parse(cmd).unwrap();
        assert_eq!(lists.wrap, vec!["malloc".to_owned(), "free".to_owned()]);
    }

    #[test]
    fn alternate_name_accumulates() {
        let cmd = ["--alternate-name", "foo=bar", "--alternate-name=baz=qux"];
        let (_, _, lists, _) = parse(cmd).unwrap();
        assert_eq!(lists.alternate_names, vec!["foo=bar".to_owned(), "baz=qux".to_owned()]);
    }

    #[test]
    fn noinhibit_exec_and_force_unresolved_flags() {
        let cmd = ["--noinhibit-exec", "--force-unresolved"];
        let (_, flags, ..) = parse(cmd).unwrap();
        assert!(flags.noinhibit_exec);
        assert!(flags.force_unresolved);
    }

    #[test]
    fn stack_and_heap_take_a_reserve_commit_value() {
        let cmd = ["-stack", "0x200000,0x2000", "--heap=0x300000"];
        let (opts, ..) = parse(cmd).unwrap();
        assert_eq!(opts.stack, Some("0x200000,0x2000".to_owned()));
        assert_eq!(opts.heap, Some("0x300000".to_owned()));
    }

    #[test]
    fn dll_characteristics_opt_out_flags() {
        let cmd = ["--no-bind", "--no-isolation", "--no-base-relocations"];
        let (_, flags, ..) = parse(cmd).unwrap();
        assert!(flags.no_bind);
        assert!(flags.no_isolation);
        assert!(flags.no_relocations);
    }
}
