//! Parser for template text

pub mod ast;
mod grammar;
pub mod lexer;

pub use ast::*;
pub use grammar::{parse, parse_with, MAX_PARSE_DEPTH};
pub use lexer::{Delims, DEFAULT_LEFT_DELIM, DEFAULT_RIGHT_DELIM};
