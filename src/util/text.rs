/// Storage width of the `slug` column.
pub const MAX_SLUG_LEN: usize = 100;

/// Fallback slug for titles with no ASCII alphanumerics
const EMPTY_SLUG: &str = "article";

/// Removes control characters, collapses whitespace runs to a single space
/// and trims the ends.
///
/// Feed titles routinely carry embedded newlines and tabs from pretty-printed
/// XML, and occasionally stray C0/C1 control bytes.
///
/// # Examples
///
/// ```
/// use newswire::util::clean_text;
///
/// assert_eq!(clean_text("  Breaking:\n\tmarkets\u{0007} rally "), "Breaking: markets rally");
/// ```
pub fn clean_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut pending_space = false;
    for c in s.chars() {
        if c.is_whitespace() {
            pending_space = !out.is_empty();
        } else if c.is_control() {
            continue;
        } else {
            if pending_space {
                out.push(' ');
                pending_space = false;
            }
            out.push(c);
        }
    }
    out
}

/// Cleans `s` and returns `None` when nothing is left.
pub fn clean_optional(s: Option<&str>) -> Option<String> {
    s.map(clean_text).filter(|t| !t.is_empty())
}

/// Truncates to at most `max_chars` characters, never splitting a char.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Derives a URL-safe slug from a title.
///
/// Lower-cases ASCII letters, keeps ASCII digits, and collapses every other
/// run of characters into a single `-`. The result is at most
/// [`MAX_SLUG_LEN`] bytes and never starts or ends with `-`. A title with no
/// usable characters yields `"article"`.
///
/// # Examples
///
/// ```
/// use newswire::util::slugify;
///
/// assert_eq!(slugify("Hello, World!"), "hello-world");
/// assert_eq!(slugify("  Rust 2024: What's New?  "), "rust-2024-what-s-new");
/// assert_eq!(slugify("¡¡¡"), "article");
/// ```
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len().min(MAX_SLUG_LEN));
    let mut pending_sep = false;

    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !slug.is_empty() {
                slug.push('-');
            }
            pending_sep = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
        if slug.len() >= MAX_SLUG_LEN {
            break;
        }
    }

    let slug = fit_slug(&slug, MAX_SLUG_LEN);
    if slug.is_empty() {
        EMPTY_SLUG.to_string()
    } else {
        slug.to_string()
    }
}

/// Builds `base-suffix` so the whole fits within [`MAX_SLUG_LEN`], cutting
/// the base rather than the suffix.
pub fn slug_with_suffix(base: &str, suffix: &str) -> String {
    let room = MAX_SLUG_LEN.saturating_sub(suffix.len() + 1);
    let head = fit_slug(base, room);
    if head.is_empty() {
        suffix.to_string()
    } else {
        format!("{head}-{suffix}")
    }
}

// Slugs are pure ASCII, so byte slicing is safe
fn fit_slug(slug: &str, max: usize) -> &str {
    let cut = if slug.len() > max { &slug[..max] } else { slug };
    cut.trim_matches('-')
}
