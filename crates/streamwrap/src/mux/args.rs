use std::fmt;

/// One token group of a muxer command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxArg {
    /// A bare switch such as `-re`.
    Flag(String),
    /// A switch with one value, e.g. `-c:v copy`.
    Option { name: String, value: String },
    /// `-i <locator>`. Generated inputs come from a local synthetic
    /// track and are never encrypted.
    Input { locator: String, generated: bool },
    /// Output sink, always last.
    Output(String),
}

impl MuxArg {
    pub fn flag(name: &str) -> Self {
        Self::Flag(name.to_string())
    }

    pub fn option(name: &str, value: impl Into<String>) -> Self {
        Self::Option {
            name: name.to_string(),
            value: value.into(),
        }
    }

    pub fn input(locator: impl Into<String>) -> Self {
        Self::Input {
            locator: locator.into(),
            generated: false,
        }
    }

    pub fn generated_input(locator: impl Into<String>) -> Self {
        Self::Input {
            locator: locator.into(),
            generated: true,
        }
    }

    pub fn output(locator: impl Into<String>) -> Self {
        Self::Output(locator.into())
    }

    pub fn is_option(&self, option: &str) -> bool {
        matches!(self, Self::Option { name, .. } if name == option)
    }

    pub fn push_tokens(&self, out: &mut Vec<String>) {
        match self {
            Self::Flag(name) => out.push(name.clone()),
            Self::Option { name, value } => {
                out.push(name.clone());
                out.push(value.clone());
            }
            Self::Input { locator, .. } => {
                out.push("-i".to_string());
                out.push(locator.clone());
            }
            Self::Output(locator) => out.push(locator.clone()),
        }
    }
}

impl fmt::Display for MuxArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flag(name) => f.write_str(name),
            Self::Option { name, value } => write!(f, "{name} {value}"),
            Self::Input { locator, .. } => write!(f, "-i {locator}"),
            Self::Output(locator) => f.write_str(locator),
        }
    }
}

/// Flatten token groups into process arguments.
pub fn render(args: &[MuxArg]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len() * 2);
    for arg in args {
        arg.push_tokens(&mut out);
    }
    out
}
