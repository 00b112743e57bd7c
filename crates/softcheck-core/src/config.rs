// Config — Scoped dispatch configuration
//
// Whether softmax takes the fused kernel path is decided per call from a
// small configuration record:
//
//   use_accel      always | auto | never   (SOFTCHECK_USE_ACCEL, default auto)
//   accel_enabled  bool                    (SOFTCHECK_ACCEL=0 turns it off)
//
// The record is thread-local. `using_config` swaps in a new record for the
// duration of a closure and restores the old one on exit, including exit by
// panic, so concurrently running tests each see only their own setting.
//
// The dispatch predicate takes a level, so callers can ask either "is the
// fused kernel forced on" (==always) or "is it at least allowed" (>=auto):
//
//                 always  auto   never
//   ==always      true    false  false
//   >=auto        true    true   false

use std::cell::RefCell;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Environment variable holding the default dispatch mode.
pub const USE_ACCEL_ENV: &str = "SOFTCHECK_USE_ACCEL";
/// Environment variable that disables the fused kernels entirely when `0`.
pub const ACCEL_ENV: &str = "SOFTCHECK_ACCEL";

/// Dispatch mode for the fused kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum UseAccel {
    Always,
    #[default]
    Auto,
    Never,
}

impl UseAccel {
    pub const ALL: [UseAccel; 3] = [UseAccel::Always, UseAccel::Auto, UseAccel::Never];

    pub fn as_str(&self) -> &'static str {
        match self {
            UseAccel::Always => "always",
            UseAccel::Auto => "auto",
            UseAccel::Never => "never",
        }
    }
}

impl fmt::Display for UseAccel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UseAccel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "always" => Ok(UseAccel::Always),
            "auto" => Ok(UseAccel::Auto),
            "never" => Ok(UseAccel::Never),
            other => Err(Error::Config(format!(
                "use_accel must be one of always, auto, never (got '{other}')"
            ))),
        }
    }
}

/// The threshold a caller asks the dispatch predicate about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccelLevel {
    /// `==always`: the fused kernel is forced on.
    Always,
    /// `>=auto`: the fused kernel is allowed.
    AtLeastAuto,
}

impl AccelLevel {
    /// Whether `mode` satisfies this level.
    pub fn admits(&self, mode: UseAccel) -> bool {
        match self {
            AccelLevel::Always => mode == UseAccel::Always,
            AccelLevel::AtLeastAuto => matches!(mode, UseAccel::Always | UseAccel::Auto),
        }
    }
}

impl FromStr for AccelLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "==always" => Ok(AccelLevel::Always),
            ">=auto" => Ok(AccelLevel::AtLeastAuto),
            other => Err(Error::Config(format!(
                "accel level must be '==always' or '>=auto' (got '{other}')"
            ))),
        }
    }
}

impl fmt::Display for AccelLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccelLevel::Always => f.write_str("==always"),
            AccelLevel::AtLeastAuto => f.write_str(">=auto"),
        }
    }
}

/// Dispatch configuration in effect on the current thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub use_accel: UseAccel,
    pub accel_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            use_accel: UseAccel::Auto,
            accel_enabled: true,
        }
    }
}

impl Config {
    /// Read the configuration from the environment. Unparseable values are
    /// logged and replaced by the default.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        if let Ok(raw) = std::env::var(USE_ACCEL_ENV) {
            match raw.parse::<UseAccel>() {
                Ok(mode) => config.use_accel = mode,
                Err(e) => log::warn!("ignoring {USE_ACCEL_ENV}: {e}"),
            }
        }
        if let Ok(raw) = std::env::var(ACCEL_ENV) {
            match raw.trim() {
                "0" | "false" | "off" => config.accel_enabled = false,
                "1" | "true" | "on" => config.accel_enabled = true,
                other => log::warn!("ignoring {ACCEL_ENV}='{other}', expected 0 or 1"),
            }
        }
        config
    }

    pub fn with_use_accel(mut self, use_accel: UseAccel) -> Self {
        self.use_accel = use_accel;
        self
    }

    pub fn with_accel_enabled(mut self, accel_enabled: bool) -> Self {
        self.accel_enabled = accel_enabled;
        self
    }

    pub fn should_use_accel(&self, level: AccelLevel) -> bool {
        self.accel_enabled && level.admits(self.use_accel)
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Config>> = const { RefCell::new(None) };
}

/// The configuration in effect on this thread, initialised from the
/// environment on first use.
pub fn current() -> Config {
    CURRENT.with(|c| *c.borrow_mut().get_or_insert_with(Config::from_env))
}

struct Restore(Option<Config>);

impl Drop for Restore {
    fn drop(&mut self) {
        let prev = self.0.take();
        CURRENT.with(|c| *c.borrow_mut() = prev);
    }
}

/// Run `f` with `config` in effect on this thread.
pub fn using_config<F, T>(config: Config, f: F) -> T
where
    F: FnOnce() -> T,
{
    let prev = CURRENT.with(|c| c.borrow_mut().replace(config));
    let _restore = Restore(prev);
    log::trace!("using_config: use_accel={}", config.use_accel);
    f()
}

/// Run `f` with only the dispatch mode overridden.
pub fn with_use_accel<F, T>(mode: UseAccel, f: F) -> T
where
    F: FnOnce() -> T,
{
    using_config(current().with_use_accel(mode), f)
}

/// Whether the fused kernels should be used at `level` under the current
/// configuration.
pub fn should_use_accel(level: AccelLevel) -> bool {
    current().should_use_accel(level)
}
