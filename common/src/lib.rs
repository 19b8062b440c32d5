use std::fmt::{Debug, Display};

use anyhow::Error;
use owo_colors::OwoColorize;

pub mod args;
pub mod shutdown;
pub mod streams;
pub mod wait;

pub fn init() {
    let disable_colors = ["1", "true"].contains(
        &std::env::var("DISABLE_COLORS")
            .unwrap_or_else(|_| String::new())
            .to_lowercase()
            .as_str(),
    );
    owo_colors::set_override(!disable_colors);
}

pub fn print_error<T>(e: T)
where
    T: Into<Error> + Display + Debug,
{
    eprintln!(
        "{}",
        format!("{:?}", e.into())
            .split("\n")
            .map(|s| s.red().to_string())
            .collect::<Vec<_>>()
            .join("\n"),
    );
}

pub fn print_warning<T>(e: T)
where
    T: Into<Error> + Display + Debug,
{
    eprintln!(
        "{}",
        format!("{:?}", e.into())
            .split("\n")
            .map(|s| s.yellow().to_string())
            .collect::<Vec<_>>()
            .join("\n"),
    );
}
