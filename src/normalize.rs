use crate::dictionary_cache::DictionarySnapshot;
use crate::models::{GuildId, UserId};

/// Default truncation cap for normalized text.
pub const DEFAULT_MAX_LEN: usize = 70;
/// Alternate cap used for user-sourced text in some call sites.
pub const USER_SOURCED_MAX_LEN: usize = 150;

const TRUNCATION_MARKER: &str = "省略";

/// Resolves mention ids to display names in the scope of a single message.
/// The real implementation is owned by the chat-gateway collaborator; this
/// crate only defines the contract it must satisfy.
pub trait MentionResolver: Send + Sync {
    fn display_name(&self, user_id: UserId) -> Option<String>;
    fn role_name(&self, role_id: UserId) -> Option<String>;
}

/// Everything `normalize` needs besides the raw text and the dictionary
/// snapshot: which guild/user this message belongs to, and a resolver for
/// any mentions it contains.
pub struct NormalizeContext<'a> {
    pub guild_id: Option<GuildId>,
    pub user_id: Option<UserId>,
    pub resolver: &'a dyn MentionResolver,
    pub max_len: usize,
}

impl<'a> NormalizeContext<'a> {
    pub fn new(resolver: &'a dyn MentionResolver) -> Self {
        Self {
            guild_id: None,
            user_id: None,
            resolver,
            max_len: DEFAULT_MAX_LEN,
        }
    }

    pub fn with_guild(mut self, guild_id: GuildId) -> Self {
        self.guild_id = Some(guild_id);
        self
    }

    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }
}

/// Apply mention/role/emoji/URL rewrites, then dictionary substitution in
/// global → guild → user order, then truncate. Pure given its inputs and the
/// dictionary snapshot.
pub fn normalize(raw: &str, ctx: &NormalizeContext<'_>, dict: &DictionarySnapshot) -> String {
    let text = rewrite_tokens(raw, ctx.resolver);
    let text = apply_dictionaries(&text, dict);
    truncate_with_marker(&text, ctx.max_len)
}

/// Single left-to-right scan over the raw text that rewrites user mentions
/// (`<@ID>`, `<@!ID>`), role mentions (`<@&ID>`), custom emoji
/// (`<a?:NAME:DIGITS>`), and bare URLs. Unresolved ids are left intact.
fn rewrite_tokens(raw: &str, resolver: &dyn MentionResolver) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '<' {
            if ch.is_whitespace() {
                out.push(ch);
                continue;
            }
            if let Some(url) = try_consume_url(ch, &mut chars) {
                out.push_str(&url);
                continue;
            }
            out.push(ch);
            continue;
        }

        match chars.peek() {
            Some('@') => {
                chars.next();
                if chars.peek() == Some(&'&') {
                    chars.next();
                    let id: String = chars.by_ref().take_while(|c| *c != '>').collect();
                    match id.parse::<UserId>().ok().and_then(|id| resolver.role_name(id)) {
                        Some(name) => out.push_str(&format!("ろーる:{name}")),
                        None => out.push_str(&format!("<@&{id}>")),
                    }
                } else {
                    let bang = chars.peek() == Some(&'!');
                    if bang {
                        chars.next();
                    }
                    let id: String = chars.by_ref().take_while(|c| *c != '>').collect();
                    match id.parse::<UserId>().ok().and_then(|id| resolver.display_name(id)) {
                        Some(name) => out.push_str(&format!("あっと{name}")),
                        None => {
                            out.push_str("<@");
                            if bang {
                                out.push('!');
                            }
                            out.push_str(&id);
                            out.push('>');
                        }
                    }
                }
            }
            Some('a') | Some(':') => {
                let animated = chars.peek() == Some(&'a');
                let mut probe = chars.clone();
                match try_consume_emoji(&mut probe, animated) {
                    Some(rewritten) => {
                        out.push_str(&rewritten);
                        chars = probe;
                    }
                    None => out.push('<'),
                }
            }
            _ => out.push('<'),
        }
    }

    out
}

/// Attempts `<:NAME:DIGITS>` or `<a:NAME:DIGITS>` starting right after `<`.
/// Operates on a cloned iterator; the caller only commits the advance on
/// `Some`, so a mismatch never disturbs the real scan position.
fn try_consume_emoji(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    animated: bool,
) -> Option<String> {
    if animated {
        chars.next(); // consume 'a'
    }
    if chars.peek() != Some(&':') {
        return None;
    }
    chars.next(); // consume ':'
    let name: String = chars.by_ref().take_while(|c| *c != ':').collect();
    let digits: String = chars.by_ref().take_while(|c| *c != '>').collect();
    if digits.chars().all(|c| c.is_ascii_digit()) && !digits.is_empty() {
        Some(format!("えもじ:{name}"))
    } else {
        None
    }
}

fn try_consume_url(
    first: char,
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
) -> Option<String> {
    let mut probe = String::new();
    probe.push(first);
    let mut lookahead = chars.clone();
    while probe.len() < 8 {
        match lookahead.peek() {
            Some(c) if !c.is_whitespace() => {
                probe.push(*c);
                lookahead.next();
            }
            _ => break,
        }
    }
    if probe.starts_with("http://") || probe.starts_with("https://") {
        while let Some(&c) = chars.peek() {
            if c.is_whitespace() {
                break;
            }
            chars.next();
        }
        Some("リンク省略".to_string())
    } else {
        None
    }
}

fn apply_dictionaries(text: &str, dict: &DictionarySnapshot) -> String {
    let mut result = text.to_string();
    for entry in dict.global.iter().chain(dict.guild.iter()).chain(dict.user.iter()) {
        result = result.replace(&entry.key, &entry.value);
    }
    result
}

fn truncate_with_marker(text: &str, max_len: usize) -> String {
    let char_count = text.chars().count();
    if char_count <= max_len {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_len).collect();
    format!("{truncated}{TRUNCATION_MARKER}")
}

/// Format the effective text for a message with image attachments per the
/// router's rule: image-only messages get a count-only phrase, mixed
/// messages get the count appended.
pub fn format_attachment_text(body: &str, image_count: usize) -> String {
    let count_phrase = if image_count == 1 {
        "1枚の画像".to_string()
    } else {
        format!("{image_count}枚の画像")
    };

    if body.trim().is_empty() {
        count_phrase
    } else if image_count == 1 {
        format!("{body}、1枚の画像")
    } else if image_count > 0 {
        format!("{body}、{image_count}枚の画像")
    } else {
        body.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dictionary_cache::DictionarySnapshot;
    use crate::models::DictionaryEntry;

    struct TestResolver;
    impl MentionResolver for TestResolver {
        fn display_name(&self, user_id: UserId) -> Option<String> {
            if user_id == 1 {
                Some("Alice".to_string())
            } else {
                None
            }
        }
        fn role_name(&self, role_id: UserId) -> Option<String> {
            if role_id == 9 {
                Some("Mods".to_string())
            } else {
                None
            }
        }
    }

    fn empty_dict() -> DictionarySnapshot {
        DictionarySnapshot {
            global: vec![],
            guild: vec![],
            user: vec![],
        }
    }

    #[test]
    fn resolves_user_mention() {
        let resolver = TestResolver;
        let ctx = NormalizeContext::new(&resolver);
        assert_eq!(normalize("<@1> hi", &ctx, &empty_dict()), "あっとAlice hi");
        assert_eq!(normalize("<@!1> hi", &ctx, &empty_dict()), "あっとAlice hi");
    }

    #[test]
    fn leaves_unresolved_mention_intact() {
        let resolver = TestResolver;
        let ctx = NormalizeContext::new(&resolver);
        assert_eq!(normalize("<@999>", &ctx, &empty_dict()), "<@999>");
    }

    #[test]
    fn resolves_role_mention() {
        let resolver = TestResolver;
        let ctx = NormalizeContext::new(&resolver);
        assert_eq!(normalize("<@&9>", &ctx, &empty_dict()), "ろーる:Mods");
    }

    #[test]
    fn rewrites_custom_emoji() {
        let resolver = TestResolver;
        let ctx = NormalizeContext::new(&resolver);
        assert_eq!(normalize("<:wave:12345>", &ctx, &empty_dict()), "えもじ:wave");
        assert_eq!(normalize("<a:wave:12345>", &ctx, &empty_dict()), "えもじ:wave");
    }

    #[test]
    fn strips_urls() {
        let resolver = TestResolver;
        let ctx = NormalizeContext::new(&resolver);
        assert_eq!(
            normalize("https://x.test/a?b=1 ok", &ctx, &empty_dict()),
            "リンク省略 ok"
        );
    }

    #[test]
    fn dictionary_scope_order_guild_then_user() {
        let resolver = TestResolver;
        let ctx = NormalizeContext::new(&resolver);
        let dict = DictionarySnapshot {
            global: vec![],
            guild: vec![DictionaryEntry {
                key: "cat".into(),
                value: "ねこ".into(),
                author_id: None,
            }],
            user: vec![DictionaryEntry {
                key: "ねこ".into(),
                value: "CAT".into(),
                author_id: Some(1),
            }],
        };
        assert_eq!(normalize("cat", &ctx, &dict), "CAT");
    }

    #[test]
    fn truncates_with_marker() {
        let resolver = TestResolver;
        let ctx = NormalizeContext::new(&resolver).with_max_len(5);
        assert_eq!(normalize("abcdefgh", &ctx, &empty_dict()), "abcde省略");
    }

    #[test]
    fn idempotent_aside_from_truncation() {
        let resolver = TestResolver;
        let ctx = NormalizeContext::new(&resolver);
        let once = normalize("plain text, no tokens", &ctx, &empty_dict());
        let twice = normalize(&once, &ctx, &empty_dict());
        assert_eq!(once, twice);
    }

    #[test]
    fn attachment_text_image_only() {
        assert_eq!(format_attachment_text("", 1), "1枚の画像");
        assert_eq!(format_attachment_text("", 3), "3枚の画像");
    }

    #[test]
    fn attachment_text_mixed() {
        assert_eq!(format_attachment_text("hi", 1), "hi、1枚の画像");
        assert_eq!(format_attachment_text("hi", 3), "hi、3枚の画像");
        assert_eq!(format_attachment_text("hi", 0), "hi");
    }
}
