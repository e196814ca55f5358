//! Producers for attributes that do not come from `lstat` or file content.

use crate::attr::{AttrValue, Attribute, AttributeMask};
use crate::file_type::FileType;
use std::io;
use std::path::Path;

/// A pluggable producer of extended attributes (ACLs, SELinux labels,
/// filesystem flags, capabilities and the like).
pub trait AttributeSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Attributes this source can produce on the running system.
    fn provides(&self) -> AttributeMask;

    /// Fetch the `wanted` attributes (a subset of [`provides`]) for one path.
    /// Must not follow symlinks.
    ///
    /// [`provides`]: AttributeSource::provides
    fn fetch(
        &self,
        path: &Path,
        file_type: FileType,
        wanted: AttributeMask,
    ) -> io::Result<Vec<(Attribute, AttrValue)>>;
}

/// Sources available on this platform.
pub fn default_sources() -> Vec<Box<dyn AttributeSource>> {
    #[allow(unused_mut)]
    let mut sources: Vec<Box<dyn AttributeSource>> = Vec::new();
    #[cfg(unix)]
    {
        if xattr::SUPPORTED_PLATFORM {
            sources.push(Box::new(XattrSource));
        }
    }
    sources
}

#[cfg(unix)]
pub use self::unix::XattrSource;

#[cfg(unix)]
mod unix {
    use super::*;
    use std::collections::BTreeMap;

    const SELINUX_KEY: &str = "security.selinux";
    const CAPABILITY_KEY: &str = "security.capability";

    /// Extended attributes read with `llistxattr`/`lgetxattr`. The SELinux
    /// label and file capabilities are split out into their own attributes.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct XattrSource;

    impl AttributeSource for XattrSource {
        fn name(&self) -> &'static str {
            "xattr"
        }

        fn provides(&self) -> AttributeMask {
            AttributeMask::of(&[Attribute::Xattrs, Attribute::Selinux, Attribute::Capabilities])
        }

        fn fetch(
            &self,
            path: &Path,
            _file_type: FileType,
            wanted: AttributeMask,
        ) -> io::Result<Vec<(Attribute, AttrValue)>> {
            let all = match read_all(path) {
                Ok(all) => all,
                Err(e) if unsupported(&e) => BTreeMap::new(),
                Err(e) => return Err(e),
            };

            let mut out = Vec::new();
            if wanted.contains(Attribute::Selinux) {
                let label = all
                    .get(SELINUX_KEY)
                    .map(|v| String::from_utf8_lossy(v).trim_end_matches('\0').to_string())
                    .unwrap_or_default();
                out.push((Attribute::Selinux, AttrValue::Text(label)));
            }
            if wanted.contains(Attribute::Capabilities) {
                let caps = all.get(CAPABILITY_KEY).map(hex::encode).unwrap_or_default();
                out.push((Attribute::Capabilities, AttrValue::Text(caps)));
            }
            if wanted.contains(Attribute::Xattrs) {
                let rest = all
                    .into_iter()
                    .filter(|(k, _)| k != SELINUX_KEY && k != CAPABILITY_KEY)
                    .collect();
                out.push((Attribute::Xattrs, AttrValue::Xattrs(rest)));
            }
            Ok(out)
        }
    }

    fn read_all(path: &Path) -> io::Result<BTreeMap<String, Vec<u8>>> {
        let mut map = BTreeMap::new();
        for name in xattr::list(path)? {
            // Removed between list and get.
            let Some(value) = xattr::get(path, &name)? else {
                continue;
            };
            map.insert(name.to_string_lossy().into_owned(), value);
        }
        Ok(map)
    }

    fn unsupported(e: &io::Error) -> bool {
        e.raw_os_error() == Some(libc::ENOTSUP) || e.kind() == io::ErrorKind::Unsupported
    }
}
