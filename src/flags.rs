//! Command-line flags.
//!
//! Syntax: `-Xname` (equivalent to `-Xname=true`) or `-Xname=<value>`
//! where the value is a boolean, an integer or a string. The flags are
//! parsed once at startup into an immutable record that every constructed
//! program receives by reference.

#[derive(Debug, Clone)]
pub struct Flags {
    /// Expose invoking GC to native calls.
    pub expose_gc: bool,
    /// Validate the stack at each interpreter step (debug builds).
    pub validate_stack: bool,
    /// Unfold the program before running.
    pub unfold_program: bool,
    /// Collect the heap when terminating a process.
    pub gc_on_delete: bool,
    /// Validate consistency of heaps around collections.
    pub validate_heaps: bool,
    /// Log decoding (debug builds).
    pub log_decoder: bool,
    /// Print statistics about the program (debug builds).
    pub print_program_statistics: bool,
    /// Print heap statistics before GC.
    pub print_heap_statistics: bool,
    /// Verbose output.
    pub verbose: bool,
    /// Print flags after parsing (debug builds).
    pub print_flags: bool,
    /// Profile the execution of the entire VM.
    pub profile: bool,
    /// Profile interval in microseconds.
    pub profile_interval: u64,
    /// Filter string for unit testing.
    pub filter: Option<String>,
    /// Use the mark-sweep mutable collector instead of the scavenger.
    pub mark_sweep: bool,
    // Temporary compiler flags.
    pub trace_compiler: bool,
    pub trace_library: bool,
}

impl Default for Flags {
    fn default() -> Flags {
        Flags {
            expose_gc: false,
            validate_stack: false,
            unfold_program: false,
            gc_on_delete: false,
            validate_heaps: false,
            log_decoder: false,
            print_program_statistics: false,
            print_heap_statistics: false,
            verbose: false,
            print_flags: false,
            profile: false,
            profile_interval: 1000,
            filter: None,
            mark_sweep: false,
            trace_compiler: false,
            trace_library: false,
        }
    }
}

fn parse_boolean(name: &str, value: &str) -> bool {
    match value {
        "true" => true,
        "false" => false,
        other => panic!("flag -X{name} expects a boolean, got '{other}'"),
    }
}

impl Flags {
    /// Extract `-X` flags from the command line, removing them from
    /// `arguments` and leaving everything else untouched.
    pub fn extract_from_command_line(arguments: &mut Vec<String>) -> Flags {
        let mut flags = Flags::default();
        arguments.retain(|argument| {
            let Some(body) = argument.strip_prefix("-X") else {
                return true;
            };
            let (name, value) = match body.split_once('=') {
                Some((name, value)) => (name, Some(value)),
                None => (body, None),
            };
            flags.set(name, value);
            false
        });
        if flags.print_flags {
            tracing::info!(?flags, "flags");
        }
        flags
    }

    fn set(&mut self, name: &str, value: Option<&str>) {
        // Non-boolean flags first; everything else defaults to true.
        match name {
            "profile_interval" => {
                let value = value.expect("-Xprofile_interval needs a value");
                self.profile_interval = value
                    .parse()
                    .expect("-Xprofile_interval expects an integer");
                return;
            }
            "filter" => {
                self.filter =
                    Some(value.expect("-Xfilter needs a value").to_string());
                return;
            }
            _ => {}
        }
        let boolean = value.map_or(true, |v| parse_boolean(name, v));
        match name {
            "expose_gc" => self.expose_gc = boolean,
            "validate_stack" => self.validate_stack = boolean,
            "unfold_program" => self.unfold_program = boolean,
            "gc_on_delete" => self.gc_on_delete = boolean,
            "validate_heaps" => self.validate_heaps = boolean,
            "log_decoder" => self.log_decoder = boolean,
            "print_program_statistics" => {
                self.print_program_statistics = boolean
            }
            "print_heap_statistics" => self.print_heap_statistics = boolean,
            "verbose" => self.verbose = boolean,
            "print_flags" => self.print_flags = boolean,
            "profile" => self.profile = boolean,
            "mark_sweep" => self.mark_sweep = boolean,
            "trace_compiler" => self.trace_compiler = boolean,
            "trace_library" => self.trace_library = boolean,
            unknown => {
                tracing::warn!(flag = unknown, "ignoring unknown -X flag")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn bare_flag_means_true() {
        let mut arguments = args(&["vm", "-Xverbose", "snapshot.bin"]);
        let flags = Flags::extract_from_command_line(&mut arguments);
        assert!(flags.verbose);
        assert_eq!(arguments, args(&["vm", "snapshot.bin"]));
    }

    #[test]
    fn explicit_boolean_and_integer_values() {
        let mut arguments = args(&[
            "-Xexpose_gc=true",
            "-Xprint_heap_statistics=false",
            "-Xprofile_interval=250",
        ]);
        let flags = Flags::extract_from_command_line(&mut arguments);
        assert!(flags.expose_gc);
        assert!(!flags.print_heap_statistics);
        assert_eq!(flags.profile_interval, 250);
        assert!(arguments.is_empty());
    }

    #[test]
    fn string_flag_keeps_its_value() {
        let mut arguments = args(&["-Xfilter=heap"]);
        let flags = Flags::extract_from_command_line(&mut arguments);
        assert_eq!(flags.filter.as_deref(), Some("heap"));
    }

    #[test]
    fn non_flag_arguments_are_preserved_in_order() {
        let mut arguments =
            args(&["first", "-Xgc_on_delete", "second", "-Xverbose", "third"]);
        let _ = Flags::extract_from_command_line(&mut arguments);
        assert_eq!(arguments, args(&["first", "second", "third"]));
    }

    #[test]
    fn defaults_match_the_documented_values() {
        let flags = Flags::default();
        assert!(!flags.expose_gc);
        assert_eq!(flags.profile_interval, 1000);
        assert!(flags.filter.is_none());
        assert!(!flags.mark_sweep);
    }
}
