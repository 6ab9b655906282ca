use std::path::PathBuf;

/// Compile options, parsed once and threaded through the pipeline.
#[derive(Clone, Debug)]
pub struct Options {
    pub in_file: PathBuf,
    pub out_file: PathBuf,

    /// Dump the abstract instructions to stderr before register allocation.
    pub print_ins: bool,

    /// Report the decisions of the output-irrelevant elimination pass.
    pub print_remove: bool,
}

impl Options {
    /// Scan argv. `None` means usage should be printed and the process should
    /// exit successfully: either `-help` was given, or `-in`/`-out` is
    /// missing. Unknown flags are skipped without complaint.
    pub fn from_args(args: impl IntoIterator<Item = String>) -> Option<Self> {
        let mut in_file = None;
        let mut out_file = None;
        let mut print_ins = false;
        let mut print_remove = false;

        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-in" => match args.next() {
                    Some(path) => in_file = Some(PathBuf::from(path)),
                    None => eprintln!("invalid argument for input file"),
                },

                "-out" => match args.next() {
                    Some(path) => out_file = Some(PathBuf::from(path)),
                    None => eprintln!("invalid argument for output file"),
                },

                "--print-ins" => print_ins = true,
                "--print-remove" => print_remove = true,

                "-help" => return None,

                _ => {}
            }
        }

        Some(Self {
            in_file: in_file?,
            out_file: out_file?,
            print_ins,
            print_remove,
        })
    }

    pub fn print_usage() {
        println!("Usage: mstar [options]");
        println!("Options:");
        println!("  -in   <file> : M* language source code");
        println!("  -out  <file> : NASM output");
        println!("  -help        : print this help page");
    }
}

#[cfg(test)]
mod tests {
    use super::Options;

    fn parse(args: &[&str]) -> Option<Options> {
        Options::from_args(args.iter().map(|arg| arg.to_string()))
    }

    #[test]
    fn in_and_out_are_required() {
        assert!(parse(&[]).is_none());
        assert!(parse(&["-in", "a.mx"]).is_none());
        assert!(parse(&["-out", "a.asm"]).is_none());

        let opts = parse(&["-in", "a.mx", "-out", "a.asm"]).unwrap();
        assert_eq!(opts.in_file.to_str(), Some("a.mx"));
        assert_eq!(opts.out_file.to_str(), Some("a.asm"));
        assert!(!opts.print_ins);
        assert!(!opts.print_remove);
    }

    #[test]
    fn unknown_flags_are_ignored() {
        let opts = parse(&["-whatever", "-in", "a.mx", "--frob", "-out", "a.asm"]).unwrap();
        assert_eq!(opts.in_file.to_str(), Some("a.mx"));
    }

    #[test]
    fn help_wins() {
        assert!(parse(&["-in", "a.mx", "-out", "a.asm", "-help"]).is_none());
    }

    #[test]
    fn debug_flags() {
        let opts = parse(&["-in", "a", "-out", "b", "--print-ins", "--print-remove"]).unwrap();
        assert!(opts.print_ins);
        assert!(opts.print_remove);
    }
}
