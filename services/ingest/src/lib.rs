//! Vendor spreadsheet ingestion: dispatch, parse, normalize and deduplicate
//! worksheets into canonical observations with cell-level provenance.

pub mod codec;
pub mod config;
pub mod dates;
pub mod dimensions;
pub mod dispatcher;
pub mod error;
pub mod errors;
pub mod fingerprint;
pub mod geo;
pub mod indicators;
pub mod logging;
pub mod observation;
pub mod parsers;
pub mod pipeline;
pub mod profile;
pub mod raw_writer;
pub mod reshape;
pub mod resolver;
pub mod store;
pub mod upserter;
pub mod validator;
pub mod values;
pub mod workbook;
pub mod worksheet;

pub use error::{PipelineError, Result};
pub use pipeline::{run_batch, BatchOptions, BatchSummary};
pub use profile::IngestProfile;
