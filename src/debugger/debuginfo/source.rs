use indexmap::IndexSet;

/// Normalize a source path: unify separators and collapse `.` and `..` components.
///
/// Symlinks are not resolved, paths from symbol files may belong to another machine.
pub fn canonicalize(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let absolute = unified.starts_with('/');

    let mut parts: Vec<&str> = vec![];
    for component in unified.split('/') {
        match component {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                _ if absolute => {}
                _ => parts.push(".."),
            },
            c => parts.push(c),
        }
    }

    let joined = parts.join("/");
    if absolute {
        format!("/{joined}")
    } else {
        joined
    }
}

/// True if `document` (canonical path from symbols) is addressed by `requested`
/// (canonical path from a client).
///
/// Relative requests match any document with the same trailing components.
pub fn path_matches(document: &str, requested: &str) -> bool {
    if document == requested {
        return true;
    }
    if requested.starts_with('/') || requested.is_empty() {
        return false;
    }
    document
        .strip_suffix(requested)
        .map(|prefix| prefix.ends_with('/'))
        .unwrap_or(false)
}

/// Dense bijection between canonical source paths and `u32` indexes.
///
/// Indexes are stable for the session lifetime, paths are never removed.
#[derive(Default, Debug)]
pub struct SourceIndex {
    paths: IndexSet<String>,
}

impl SourceIndex {
    pub fn get_or_insert(&mut self, canonical_path: &str) -> u32 {
        if let Some(idx) = self.paths.get_index_of(canonical_path) {
            return idx as u32;
        }
        let (idx, _) = self.paths.insert_full(canonical_path.to_string());
        idx as u32
    }

    pub fn index_of(&self, canonical_path: &str) -> Option<u32> {
        self.paths.get_index_of(canonical_path).map(|idx| idx as u32)
    }

    pub fn path_of(&self, idx: u32) -> Option<&str> {
        self.paths.get_index(idx as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}
