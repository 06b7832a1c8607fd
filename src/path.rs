//! Narrow path-prefix -> volume-number interface. Full
//! path parsing and the multi-volume container are out of scope; this is
//! only the seam a collaborator crosses to find which [`crate::Volume`]
//! a path belongs to.

/// One registered volume-number -> path-prefix mapping.
#[derive(Debug, Clone, Copy)]
pub struct VolumePrefix<'a> {
    pub volume_number: u32,
    pub prefix: &'a str,
}

/// Resolves `path` against a table of registered prefixes, returning the
/// volume number of the longest matching prefix and the remainder of the
/// path relative to it.
pub fn resolve<'a>(
    table: &[VolumePrefix<'a>],
    path: &'a str,
) -> Option<(u32, &'a str)> {
    table
        .iter()
        .filter(|v| path.starts_with(v.prefix))
        .max_by_key(|v| v.prefix.len())
        .map(|v| (v.volume_number, &path[v.prefix.len()..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    extern crate std;

    #[test]
    fn resolves_longest_matching_prefix() {
        let table = [
            VolumePrefix {
                volume_number: 0,
                prefix: "/",
            },
            VolumePrefix {
                volume_number: 1,
                prefix: "/data",
            },
        ];
        assert_eq!(resolve(&table, "/data/file"), Some((1, "/file")));
        assert_eq!(resolve(&table, "/etc/passwd"), Some((0, "etc/passwd")));
    }
}
