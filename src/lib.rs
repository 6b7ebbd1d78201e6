pub mod backend;
pub mod checkpoint;
pub mod corpus;
pub mod data_helpers;
pub mod decode;
pub mod early_stopping;
pub mod masks;
pub mod model;
pub mod preprocess;
pub mod train;
pub mod translate;
pub mod vocab;
