// canvasync-common: shared wire protocol and canvas data model

pub mod protocol;
pub mod types;
