//! Header/Table codec: flattens merged multi-row headers and serializes
//! worksheets for the raw provenance layer.

pub mod header;
pub mod table;

pub use header::{
    detect_header_row, extract_date_grouped_subcolumns, flatten, flatten_rows, header_signature,
    DateGroup,
};
pub use table::{serialize, SerializeOptions, SerializedTable, TableGrid};
