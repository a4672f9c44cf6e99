//! Output filename construction.

use super::resolver::GalleryMetadata;

/// Characters that are not allowed in output filenames.
const RESERVED: [char; 9] = ['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

/// Replaces every reserved character with `_`.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| if RESERVED.contains(&c) { '_' } else { c })
        .collect()
}

/// Base filename (no extension) for a gallery.
///
/// Uses the pretty title, then the English, then the Japanese one, and
/// `untitled` when none is set. With `prepend_id` the result starts with
/// `[{id}] `.
#[must_use]
pub fn base_filename(meta: &GalleryMetadata, prepend_id: bool) -> String {
    let title = [&meta.title.pretty, &meta.title.english, &meta.title.japanese]
        .into_iter()
        .flatten()
        .map(|t| t.trim())
        .find(|t| !t.is_empty())
        .unwrap_or("untitled");

    let name = sanitize_filename(title);
    if prepend_id {
        format!("[{}] {name}", meta.id)
    } else {
        name
    }
}
