//! Core data model for operation execution.
//!
//! Holds the parameter and operation definitions consumed by the runner,
//! the typed parameter values, and the textual codec used whenever values
//! cross the command-line boundary.

pub mod codec;
pub mod error;
pub mod operation;
pub mod output;
pub mod param;
pub mod value;

pub use codec::{decode, encode, encode_param, join_encoded, quote_arg, split_cmd, split_encoded};
pub use error::{DecodeError, ParameterError};
pub use operation::OperationDef;
pub use output::{OutputRecord, StreamTag, RECORD_LEN};
pub use param::{ArgSplit, Choice, FlagType, ParameterSpec};
pub use value::{FlagFunction, ParamValue, ResolvedParameters, Value};
