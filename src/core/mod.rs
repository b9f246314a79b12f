pub(crate) mod assemble;
pub(crate) mod cluster;
pub(crate) mod correlate;
pub(crate) mod deadline;
pub(crate) mod document;
pub(crate) mod geometry;
pub(crate) mod page;
pub(crate) mod pixmap;
pub(crate) mod postprocess;
pub(crate) mod record;
pub(crate) mod writer;
