//! Textual path manipulation for the paths we find in DWARF data. These are
//! byte strings, not `std::path::Path`s: the debug info records whatever bytes
//! the compiler wrote, and we must reproduce them exactly.

/// Canonicalizes `path` by collapsing `.` and `..` segments, duplicate
/// separators and trailing separators. A leading `//` is kept as-is (POSIX
/// namespace escape). Never returns an empty path; a path that collapses to
/// nothing becomes `.`.
pub(crate) fn canonicalize_path(path: &[u8]) -> Vec<u8> {
    let mut out: Vec<u8> = Vec::with_capacity(path.len() + 1);
    let mut i = 0;

    if path.first() == Some(&b'/') {
        out.push(b'/');
        i += 1;
        // Exactly two leading slashes are a Posix namespace escape and must
        // survive canonicalization.
        if path.get(i) == Some(&b'/') && path.get(i + 1) != Some(&b'/') {
            out.push(b'/');
            i += 1;
        }
        while path.get(i) == Some(&b'/') {
            i += 1;
        }
    }
    let root = out.len();

    while i < path.len() {
        // We're always at the beginning of a path segment here.
        if path[i] == b'.' && matches!(path.get(i + 1), None | Some(b'/')) {
            i += 1;
            while path.get(i) == Some(&b'/') {
                i += 1;
            }
        } else if path[i] == b'.'
            && path.get(i + 1) == Some(&b'.')
            && matches!(path.get(i + 2), None | Some(b'/'))
        {
            if let Some(pre) = previous_segment_start(&out, root) {
                if out.len() == pre + 3 && &out[pre..pre + 2] == b".." {
                    // The previous segment is itself `..`, keep accumulating.
                    out.extend_from_slice(b"..");
                    i += 2;
                } else {
                    out.truncate(pre);
                    i += 2;
                    while path.get(i) == Some(&b'/') {
                        i += 1;
                    }
                }
            } else {
                out.extend_from_slice(b"..");
                i += 2;
            }
        } else {
            while i < path.len() && path[i] != b'/' {
                out.push(path[i]);
                i += 1;
            }
        }

        if path.get(i) == Some(&b'/') {
            out.push(b'/');
            i += 1;
            while path.get(i) == Some(&b'/') {
                i += 1;
            }
        }
    }

    while out.len() > root && out.last() == Some(&b'/') {
        out.pop();
    }
    if out.is_empty() {
        out.push(b'.');
    }
    out
}

/// Finds the start of the last complete segment written to `out`, for `..`
/// collapsing. Returns `None` when there is no poppable segment (the output is
/// still at its root).
fn previous_segment_start(out: &[u8], root: usize) -> Option<usize> {
    if out.len() <= root {
        return None;
    }
    let mut pre = out.len() - 1;
    while pre > root && out[pre] == b'/' {
        pre -= 1;
    }
    if out[pre] == b'/' {
        return None;
    }
    while pre > root && out[pre] != b'/' {
        pre -= 1;
    }
    if pre > root {
        pre += 1;
    }
    Some(pre)
}

/// Returns the rest of `path` after `dir_prefix`, skipping any `/` separators,
/// or `None` if `path` doesn't start with `dir_prefix`. Might return the empty
/// string if `path` equals `dir_prefix` (modulo trailing slashes). Never
/// returns a path starting with `/`. `dir_prefix` itself must not end with a
/// `/`.
pub(crate) fn skip_dir_prefix<'a>(path: &'a [u8], dir_prefix: &[u8]) -> Option<&'a [u8]> {
    let mut rest = path.strip_prefix(dir_prefix)?;
    // Unless path == dir_prefix there should be at least one '/' in the rest
    // (which we skip). Otherwise the path has a different (longer) directory
    // prefix.
    if !rest.is_empty() && rest[0] != b'/' {
        return None;
    }
    while rest.first() == Some(&b'/') {
        rest = &rest[1..];
    }
    Some(rest)
}

/// Builds the replacement for `path` when its `base` prefix is rewritten to
/// `dest`: `dest`, a separator and the remaining suffix (just `dest` when the
/// suffix is empty). Returns `None` if `path` isn't under `base`.
pub(crate) fn replace_dir_prefix(path: &[u8], base: &[u8], dest: &[u8]) -> Option<Vec<u8>> {
    let suffix = skip_dir_prefix(path, base)?;
    let mut out = Vec::with_capacity(dest.len() + 1 + suffix.len());
    out.extend_from_slice(dest);
    if !suffix.is_empty() {
        out.push(b'/');
        out.extend_from_slice(suffix);
    }
    Some(out)
}
