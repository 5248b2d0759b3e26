//! Run-time configuration, settable from the environment or the embedder.

use std::default::Default;
use std::fmt::Debug;

use strum_macros::EnumString;

use crate::util::constants::{BYTES_IN_BLOCK, BYTES_IN_GBYTE};
use crate::util::conversions::raw_align_up;
use crate::util::os::{Os, OsMemory};

/// When should a freshly reserved arena be committed eagerly?
#[derive(Copy, Clone, EnumString, Debug, PartialEq, Eq)]
pub enum EagerCommit {
    /// Commit eagerly iff the OS overcommits anyway.
    Auto,
    /// Always commit the whole reservation up front.
    Always,
    /// Reserve address space only; commit on demand.
    Never,
}

fn always_valid<T>(_: &T) -> bool {
    true
}

/// The default reserve size for a fresh arena: 1 GiB, capped at an eighth
/// of physical memory on small machines, in whole blocks.
fn default_arena_reserve() -> usize {
    let total = <Os as OsMemory>::get_system_total_memory() as usize;
    let capped = (total / 8).clamp(16 * BYTES_IN_BLOCK, BYTES_IN_GBYTE);
    raw_align_up(capped, BYTES_IN_BLOCK)
}

/// An option of a given type. This type allows us to store some metadata
/// for the option. To get the value of an option, simply dereference it
/// (for example, `*options.purge_delay`).
#[derive(Clone)]
pub struct ArenaOption<T: Debug + Clone> {
    /// The actual value for the option
    value: T,
    /// The validator to ensure the value is valid.
    validator: fn(&T) -> bool,
    /// Can we set this option through env vars?
    from_env_var: bool,
    /// Can we set this option through the API?
    from_command_line: bool,
}

impl<T: Debug + Clone> ArenaOption<T> {
    pub fn new(
        value: T,
        validator: fn(&T) -> bool,
        from_env_var: bool,
        from_command_line: bool,
    ) -> Self {
        ArenaOption {
            value,
            validator,
            from_env_var,
            from_command_line,
        }
    }

    /// Set the option to the given value. Returns true if the value is
    /// valid, and we set the option to the value.
    pub fn set(&mut self, value: T) -> bool {
        if (self.validator)(&value) {
            self.value = value;
            return true;
        }
        false
    }
}

// Dereference an option to get its value.
impl<T: Debug + Clone> std::ops::Deref for ArenaOption<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

macro_rules! options {
    // Verify whether we can set an option through env var or command line.
    (@verify_set_from($self: expr, $key: expr, $verify_field: ident, $($name: ident),*)) => {
        match $key {
            $(stringify!($name) => { assert!($self.$name.$verify_field, "cannot set option {} (not {})", $key, stringify!($verify_field)) }),*
            _ => panic!("Invalid Options key: {}", $key)
        }
    };

    ($($name:ident: $type:ty [env_var: $env_var:expr, command_line: $command_line:expr] [$validator:expr] = $default:expr),* $(,)?) => [
        /// The options for an arena allocator instance.
        #[derive(Clone)]
        pub struct Options {
            $(pub $name: ArenaOption<$type>),*
        }
        impl Options {
            /// Set an option from an env var.
            pub fn set_from_env_var(&mut self, s: &str, val: &str) -> bool {
                options!(@verify_set_from(self, s, from_env_var, $($name),*));
                self.set_inner(s, val)
            }

            /// Set an option from the API.
            pub fn set_from_command_line(&mut self, s: &str, val: &str) -> bool {
                options!(@verify_set_from(self, s, from_command_line, $($name),*));
                self.set_inner(s, val)
            }

            /// Bulk process options. Returns true if all the options are
            /// processed successfully.
            ///
            /// Arguments:
            /// * `options`: a string of key value pairs separated by white
            ///   spaces or commas, e.g. `purge_delay=0 arena_reserve=67108864`.
            pub fn set_bulk_from_command_line(&mut self, options: &str) -> bool {
                for opt in options.replace(',', " ").split_ascii_whitespace() {
                    let kv_pair: Vec<&str> = opt.split('=').collect();
                    if kv_pair.len() != 2 {
                        return false;
                    }
                    if !self.set_from_command_line(kv_pair[0], kv_pair[1]) {
                        return false;
                    }
                }
                true
            }

            /// Set an option and run its validator for its value.
            fn set_inner(&mut self, s: &str, val: &str) -> bool {
                match s {
                    $(stringify!($name) => if let Ok(typed_val) = val.parse::<$type>() {
                        let is_set = self.$name.set(typed_val);
                        if !is_set {
                            eprintln!("Warn: unable to set {}={:?}. Invalid value. Default value will be used.", s, val);
                        }
                        is_set
                    } else {
                        eprintln!("Warn: unable to set {}={:?}. Can't parse value. Default value will be used.", s, val);
                        false
                    })*
                    _ => panic!("Invalid Options key: {}", s)
                }
            }

            /// Create an `Options` instance with built-in default settings.
            fn new() -> Self {
                Options {
                    $($name: ArenaOption::new($default, $validator, $env_var, $command_line)),*
                }
            }

            /// Read options from environment variables, and apply those
            /// settings to self.
            ///
            /// If we have environment variables that start with `VMARENA_`
            /// and match an option (such as `VMARENA_PURGE_DELAY`), we set
            /// the option to its value (if it is a valid value).
            pub fn read_env_var_settings(&mut self) {
                const PREFIX: &str = "VMARENA_";
                for (key, val) in std::env::vars() {
                    // strip the prefix, and get the lower case string
                    if let Some(rest_of_key) = key.strip_prefix(PREFIX) {
                        let lowercase: &str = &rest_of_key.to_lowercase();
                        match lowercase {
                            $(stringify!($name) => { self.set_from_env_var(lowercase, &val); },)*
                            _ => {}
                        }
                    }
                }
            }
        }

        impl Default for Options {
            /// By default, `Options` instance is created with built-in
            /// default settings.
            fn default() -> Self {
                Self::new()
            }
        }
    ]
}

options! {
    // Address-space budget for a freshly reserved arena. Zero disables
    // eager arena reservation entirely.
    arena_reserve:        usize       [env_var: true, command_line: true] [always_valid] = default_arena_reserve(),
    // Whether a fresh arena reservation is committed up front. Auto commits
    // eagerly only when the OS overcommits.
    arena_eager_commit:   EagerCommit [env_var: true, command_line: true] [always_valid] = EagerCommit::Auto,
    // Delay in milliseconds before freed blocks have their physical memory
    // purged. 0 purges synchronously at free time; negative disables
    // purging altogether.
    purge_delay:          i64         [env_var: true, command_line: true] [always_valid] = 10,
    // Multiplier applied to purge_delay for arena blocks (they are large,
    // so reclaiming them is worth a longer wait).
    arena_purge_mult:     usize       [env_var: true, command_line: true] [|v: &usize| *v > 0] = 10,
    // Purge by decommitting (pages must be committed again before use)
    // rather than resetting (pages stay accessible, content is discarded).
    purge_decommits:      bool        [env_var: true, command_line: true] [always_valid] = true,
    // Never serve allocations from arenas; delegate everything to the OS.
    disallow_arena_alloc: bool        [env_var: true, command_line: true] [always_valid] = false,
    // Never fall back to direct OS allocation when no arena can serve a
    // request.
    disallow_os_alloc:    bool        [env_var: true, command_line: true] [always_valid] = false,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::{serial_test, with_cleanup};

    #[test]
    fn no_env_var() {
        serial_test(|| {
            let mut options = Options::default();
            options.read_env_var_settings();
            assert_eq!(*options.purge_delay, 10);
            assert_eq!(*options.arena_purge_mult, 10);
            assert!(*options.purge_decommits);
            assert_eq!(*options.arena_reserve % BYTES_IN_BLOCK, 0);
        })
    }

    #[test]
    fn with_valid_env_var() {
        serial_test(|| {
            with_cleanup(
                || {
                    std::env::set_var("VMARENA_PURGE_DELAY", "0");
                    let mut options = Options::default();
                    options.read_env_var_settings();
                    assert_eq!(*options.purge_delay, 0);
                },
                || {
                    std::env::remove_var("VMARENA_PURGE_DELAY");
                },
            )
        })
    }

    #[test]
    fn with_invalid_env_var_value() {
        serial_test(|| {
            with_cleanup(
                || {
                    // zero is rejected by the validator; the default stays
                    std::env::set_var("VMARENA_ARENA_PURGE_MULT", "0");
                    let mut options = Options::default();
                    options.read_env_var_settings();
                    assert_eq!(*options.arena_purge_mult, 10);
                },
                || {
                    std::env::remove_var("VMARENA_ARENA_PURGE_MULT");
                },
            )
        })
    }

    #[test]
    fn bulk_set() {
        serial_test(|| {
            let mut options = Options::default();
            assert!(options.set_bulk_from_command_line("purge_delay=-1,arena_eager_commit=Never"));
            assert_eq!(*options.purge_delay, -1);
            assert_eq!(*options.arena_eager_commit, EagerCommit::Never);
            assert!(!options.set_bulk_from_command_line("purge_delay"));
        })
    }
}
