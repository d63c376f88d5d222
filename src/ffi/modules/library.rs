use core::fmt::{self, Display};
use std::path::{Path, PathBuf};

use libloading::Library;

use crate::{
    config::Settings,
    ffi::{ENTRY_SYMBOL, Entry},
    internal,
    session::Session,
};

use super::Error;

/// A module living in a shared library.
pub struct Native {
    name: String,
    path: PathBuf,
    entry: Entry,
    // Keeps `entry` valid; dropped (or closed) only with the module.
    library: Library,
}

impl Display for Native {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.path.display())
    }
}

impl Native {
    /// The file a module called `name` is expected to live in.
    pub fn path(name: &str, module_dir: Option<&Path>) -> PathBuf {
        let file = libloading::library_filename(name);
        module_dir.map_or_else(|| PathBuf::from(&file), |dir| dir.join(&file))
    }

    pub(super) fn open(name: &str, module_dir: Option<&Path>) -> Result<Self, Error> {
        let path = Self::path(name, module_dir);
        internal!(level = DEBUG, "Loading module {name} from {}", path.display());

        let library = unsafe { Library::new(&path) }.map_err(|source| Error::Load {
            name: name.to_string(),
            source,
        })?;

        let entry = unsafe { library.get::<Entry>(ENTRY_SYMBOL) }
            .map(|symbol| *symbol)
            .map_err(|source| Error::MissingEntry {
                name: name.to_string(),
                source,
            })?;

        Ok(Self {
            name: name.to_string(),
            path,
            entry,
            library,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(super) fn invoke(&self, settings: &Settings, session: &mut Session) -> i32 {
        unsafe {
            (self.entry)(
                core::ptr::from_ref(settings).cast(),
                core::ptr::from_mut(session).cast(),
            )
        }
    }

    pub(super) fn close(self) -> Result<(), Error> {
        let Self { name, library, .. } = self;
        library.close().map_err(|source| Error::Unload { name, source })
    }
}
