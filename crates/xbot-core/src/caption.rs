use crate::media::MediaEntry;

pub const ELLIPSIS: char = '…';

/// How far back from the limit a sentence boundary may be used for the cut.
const BOUNDARY_WINDOW: usize = 10;

const SENTENCE_ENDS: &[char] = &['.', '!', '?', '。', '！', '？', '\n'];

/// Publish time as shown to readers: `YYYY-MM-DD HH:MM:SS`.
pub fn display_time(publish_time: &str) -> String {
    publish_time.chars().take(19).collect::<String>().replace('T', " ")
}

/// `#<screenName> <displayName>\n<publishTime>\n<fullText>`, cut to `max_chars`.
///
/// Only the body is ever shortened.
pub fn build_caption(entry: &MediaEntry, max_chars: usize) -> String {
    let header = format!(
        "#{} {}\n{}\n",
        entry.user.screen_name,
        entry.user.name,
        display_time(&entry.publish_time)
    );
    truncate_body(&header, &entry.full_text, max_chars)
}

/// Text notice for special types: caption followed by the link.
pub fn build_notice(entry: &MediaEntry, max_chars: usize) -> String {
    format!("{}\n{}", build_caption(entry, max_chars), entry.url)
}

fn truncate_body(header: &str, body: &str, max_chars: usize) -> String {
    let header_len = header.chars().count();
    let body_len = body.chars().count();
    if header_len + body_len <= max_chars {
        return format!("{}{}", header, body);
    }

    let available = max_chars.saturating_sub(header_len + 1);
    let cut: Vec<char> = body.chars().take(available).collect();

    let window_start = cut.len().saturating_sub(BOUNDARY_WINDOW);
    let end = cut[window_start..]
        .iter()
        .rposition(|c| SENTENCE_ENDS.contains(c))
        .map(|p| {
            let idx = window_start + p;
            if cut[idx] == '\n' {
                idx
            } else {
                idx + 1
            }
        })
        .unwrap_or(cut.len());

    let kept: String = cut[..end].iter().collect();
    format!("{}{}{}", header, kept.trim_end(), ELLIPSIS)
}
