pub mod archive;
pub mod copy;
pub mod manifest;
pub mod meta;
pub mod output;
pub mod run;
pub mod select;
pub mod var;

pub use archive::Archive;
pub use manifest::{ManifestEntry, ManifestKind, ManifestReader};
pub use meta::{Marker, MetaSource, Phase};
pub use output::{OutputLine, OutputReader, OutputStream, OutputWriter};
pub use run::{Run, RunAttr, RunStatus, RunView};
pub use select::{filter_runs, select_one, select_runs, RunFilter, Specifier};
pub use var::{VarStore, View};
