use std::fmt;

/// Error shown to the user as a single line before exiting non-zero
#[derive(Debug)]
pub struct CliError(pub String);

impl CliError {
    pub fn not_found(what: &str, id: &str) -> Self {
        CliError(format!("{what} not found: {id}"))
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for CliError {}

impl From<String> for CliError {
    fn from(s: String) -> Self {
        CliError(s)
    }
}

impl From<&str> for CliError {
    fn from(s: &str) -> Self {
        CliError(s.to_owned())
    }
}

macro_rules! prefixed_from {
    ($($source:ty => $prefix:literal),* $(,)?) => {
        $(
            impl From<$source> for CliError {
                fn from(e: $source) -> Self {
                    CliError(format!("{}{}", $prefix, e))
                }
            }
        )*
    };
}

prefixed_from! {
    arbor::ArborError => "",
    serde_json::Error => "JSON error: ",
    toml::ser::Error => "TOML error: ",
    std::io::Error => "IO error: ",
}

pub type CliResult<T> = Result<T, CliError>;
