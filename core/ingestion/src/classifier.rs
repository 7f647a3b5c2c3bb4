use recap_schemas::{ActionTag, AppCategory};
use regex::Regex;
use serde::Serialize;

/// Result of classifying one scene/visual description.
#[derive(Debug, Clone, Serialize)]
pub struct SceneClassification {
    pub app_name: String,
    pub category: AppCategory,
    pub action: Option<String>,
    pub details: Option<String>,
}

struct AppRule {
    pattern: Regex,
    app: &'static str,
    category: AppCategory,
}

/// Ordered list: first match wins, so more specific rules come first.
const APP_RULE_TABLE: &[(&str, &str, AppCategory)] = &[
    (r"(?i)visual studio code|vs ?code", "Visual Studio Code", AppCategory::Development),
    (r"(?i)intellij", "IntelliJ IDEA", AppCategory::Development),
    (r"(?i)xcode", "Xcode", AppCategory::Development),
    (r"(?i)\biterm\b|\bterminal\b", "Terminal", AppCategory::Development),
    (r"(?i)github", "GitHub", AppCategory::Development),
    (r"(?i)stack overflow", "Stack Overflow", AppCategory::Development),
    (r"(?i)google chrome|\bchrome\b", "Google Chrome", AppCategory::Browsing),
    (r"(?i)\bsafari\b", "Safari", AppCategory::Browsing),
    (r"(?i)firefox", "Firefox", AppCategory::Browsing),
    (r"(?i)\bslack\b", "Slack", AppCategory::Communication),
    (r"(?i)discord", "Discord", AppCategory::Communication),
    (r"(?i)\bzoom\b", "Zoom", AppCategory::Communication),
    (r"(?i)microsoft teams|\bteams\b", "Microsoft Teams", AppCategory::Communication),
    (r"(?i)notion", "Notion", AppCategory::Documents),
    (r"(?i)obsidian", "Obsidian", AppCategory::Documents),
    (r"(?i)google docs", "Google Docs", AppCategory::Documents),
    (r"(?i)microsoft word", "Microsoft Word", AppCategory::Documents),
    (r"(?i)figma", "Figma", AppCategory::Design),
    (r"(?i)\bsketch\b", "Sketch", AppCategory::Design),
    (r"(?i)photoshop", "Photoshop", AppCategory::Design),
    (r"(?i)gmail", "Gmail", AppCategory::Email),
    (r"(?i)outlook", "Outlook", AppCategory::Email),
    (r"(?i)youtube", "YouTube", AppCategory::Entertainment),
    (r"(?i)netflix", "Netflix", AppCategory::Entertainment),
    (r"(?i)spotify", "Spotify", AppCategory::Entertainment),
];

/// Action tags in priority order with the keywords that select them.
const ACTION_KEYWORDS: &[(ActionTag, &[&str])] = &[
    (ActionTag::Coding, &["coding", "code editor", "debugg", "terminal", "compil", "pull request", "refactor"]),
    (ActionTag::Browsing, &["browsing", "browser", "searching", "search results", "web page"]),
    (ActionTag::Chatting, &["chatting", "chat", "messag", "slack", "discord"]),
    (ActionTag::Reading, &["reading", "article", "documentation"]),
    (ActionTag::Meeting, &["meeting", "video call", "zoom", "conference"]),
    (ActionTag::Writing, &["writing", "drafting", "taking notes", "editing a document"]),
    (ActionTag::Designing, &["designing", "design", "figma", "prototyp", "canvas"]),
    (ActionTag::Watching, &["watching", "video playback", "youtube"]),
    (ActionTag::Emailing, &["email", "inbox", "compose"]),
];

/// Folder names that show up in paths but never name a project.
const NON_PROJECT_DIRS: &[&str] = &[
    "home", "users", "user", "desktop", "documents", "downloads", "applications",
    "library", "tmp", "temp", "var", "opt", "usr", "bin", "etc",
    "node_modules", "dist", "build", "target", "vendor", "out",
];

/// Single generic words that are valid folder names but useless as projects.
const GENERIC_WORDS: &[&str] = &[
    "project", "projects", "code", "work", "workspace", "repo", "repos",
    "test", "tests", "new", "untitled", "folder", "files", "stuff",
    "misc", "demo", "example", "examples", "main", "dev", "src",
];

/// Stateless scene/alert classifier with precompiled rule tables.
///
/// "No match" is a valid outcome everywhere: category `Other`, action
/// `Working`, no project.
pub struct SceneClassifier {
    rules: Vec<AppRule>,
    ide_title: Regex,
    source_path: Regex,
    domain_like: Regex,
}

impl Default for SceneClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl SceneClassifier {
    pub fn new() -> Self {
        let rules = APP_RULE_TABLE
            .iter()
            .map(|&(pattern, app, category)| AppRule {
                pattern: Regex::new(pattern).unwrap(),
                app,
                category,
            })
            .collect();

        Self {
            rules,
            // "main.rs — recap — Visual Studio Code": the candidate is the
            // segment immediately preceding the editor name.
            ide_title: Regex::new(
                r"(?i)([^—–|-]+?)\s*[—–-]\s*(?:visual studio code|vs ?code|intellij idea|webstorm|pycharm|xcode|sublime text|zed|cursor)\b",
            )
            .unwrap(),
            source_path: Regex::new(r"([A-Za-z0-9_.-]+)/(?:src|lib|app|packages|cmd)(?:/|\b)")
                .unwrap(),
            domain_like: Regex::new(r"(?i)^www\.|\.(com|org|net|io|rs|dev|co|ai|edu|gov|app)$")
                .unwrap(),
        }
    }

    /// Classify one scene/visual description into app, category and optional
    /// action/details.
    ///
    /// Tries, in order: `"APP | ACTION | DETAILS"`, `"APP - ACTION - DETAILS"`,
    /// then a full-text scan of the rule table; first match wins. Falls back
    /// to a short phrase from the first line with category `Other`.
    pub fn classify_scene(&self, text: &str) -> SceneClassification {
        let trimmed = text.trim();

        if let Some((app, action, details)) = parse_delimited(trimmed, '|', 2) {
            let category = self.category_for(&app);
            return SceneClassification { app_name: app, category, action, details };
        }

        if let Some((app, action, details)) = parse_spaced_dash(trimmed) {
            let category = self.category_for(&app);
            return SceneClassification { app_name: app, category, action, details };
        }

        for rule in &self.rules {
            if rule.pattern.is_match(trimmed) {
                return SceneClassification {
                    app_name: rule.app.to_string(),
                    category: rule.category,
                    action: None,
                    details: None,
                };
            }
        }

        SceneClassification {
            app_name: short_phrase(trimmed),
            category: AppCategory::Other,
            action: None,
            details: None,
        }
    }

    /// Classify a detection alert by its label and event name.
    pub fn classify_alert(&self, label: &str, event_name: &str) -> (String, AppCategory) {
        let combined = format!("{label} {event_name}");
        for rule in &self.rules {
            if rule.pattern.is_match(&combined) {
                return (rule.app.to_string(), rule.category);
            }
        }

        let app = if !label.trim().is_empty() {
            label.trim().to_string()
        } else if !event_name.trim().is_empty() {
            event_name.trim().to_string()
        } else {
            "System".to_string()
        };
        (app, AppCategory::Other)
    }

    /// First matching action tag, by priority, over the concatenated scene
    /// texts. Defaults to `Working`.
    pub fn infer_action(&self, scene_texts: &[String]) -> ActionTag {
        let combined = scene_texts.join(" ").to_lowercase();
        for (tag, keywords) in ACTION_KEYWORDS {
            if keywords.iter().any(|k| combined.contains(k)) {
                return *tag;
            }
        }
        ActionTag::Working
    }

    /// First valid project-name candidate found scanning the texts in order:
    /// an IDE title-bar segment, or a path segment preceding a conventional
    /// source subdirectory.
    pub fn infer_project(&self, scene_texts: &[String]) -> Option<String> {
        for text in scene_texts {
            if let Some(caps) = self.ide_title.captures(text) {
                if let Some(candidate) = caps.get(1) {
                    let candidate = candidate.as_str().trim();
                    if self.is_valid_project(candidate) {
                        return Some(candidate.to_string());
                    }
                }
            }

            for caps in self.source_path.captures_iter(text) {
                if let Some(candidate) = caps.get(1) {
                    let candidate = candidate.as_str().trim();
                    if self.is_valid_project(candidate) {
                        return Some(candidate.to_string());
                    }
                }
            }
        }
        None
    }

    fn category_for(&self, app_text: &str) -> AppCategory {
        for rule in &self.rules {
            if rule.pattern.is_match(app_text) {
                return rule.category;
            }
        }
        AppCategory::Other
    }

    fn is_valid_project(&self, candidate: &str) -> bool {
        let name = candidate.trim();
        if name.len() < 2 || name.len() > 40 {
            return false;
        }
        if name.contains("://") || name.contains(' ') && name.split_whitespace().count() > 3 {
            return false;
        }

        let lower = name.to_lowercase();
        if self.domain_like.is_match(&lower) {
            return false;
        }
        if NON_PROJECT_DIRS.contains(&lower.as_str()) {
            return false;
        }
        if GENERIC_WORDS.contains(&lower.as_str()) {
            return false;
        }
        true
    }
}

/// Split the first line on a delimiter; `None` below `min_parts`.
fn parse_delimited(
    text: &str,
    delimiter: char,
    min_parts: usize,
) -> Option<(String, Option<String>, Option<String>)> {
    let first_line = text.lines().next()?;
    if !first_line.contains(delimiter) {
        return None;
    }

    let parts: Vec<&str> = first_line
        .split(delimiter)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    if parts.len() < min_parts {
        return None;
    }

    Some((
        parts[0].to_string(),
        parts.get(1).map(|p| p.to_string()),
        parts.get(2).map(|p| p.to_string()),
    ))
}

/// `"APP - ACTION - DETAILS"`. Three spaced-dash parts are required so
/// hyphenated titles don't false-positive.
fn parse_spaced_dash(text: &str) -> Option<(String, Option<String>, Option<String>)> {
    let first_line = text.lines().next()?;
    let parts: Vec<&str> = first_line
        .split(" - ")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    if parts.len() < 3 {
        return None;
    }

    Some((
        parts[0].to_string(),
        Some(parts[1].to_string()),
        Some(parts[2..].join(" - ")),
    ))
}

/// Short phrase from the first line, for the no-match fallback.
fn short_phrase(text: &str) -> String {
    let first_line = text.lines().next().unwrap_or("").trim();
    if first_line.is_empty() {
        return "Unknown".to_string();
    }

    let phrase: String = first_line.split_whitespace().take(5).collect::<Vec<_>>().join(" ");
    let mut phrase: String = phrase.chars().take(48).collect();
    phrase = phrase.trim_end().to_string();
    if phrase.is_empty() {
        "Unknown".to_string()
    } else {
        phrase
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_table_round_trip() {
        let classifier = SceneClassifier::new();
        let cases = [
            ("Editing a file in Visual Studio Code", "Visual Studio Code", AppCategory::Development),
            ("IntelliJ showing a stack trace", "IntelliJ IDEA", AppCategory::Development),
            ("Xcode build in progress", "Xcode", AppCategory::Development),
            ("A terminal window running htop", "Terminal", AppCategory::Development),
            ("Reviewing a GitHub pull request", "GitHub", AppCategory::Development),
            ("Stack Overflow answer about lifetimes", "Stack Overflow", AppCategory::Development),
            ("Google Chrome with many tabs", "Google Chrome", AppCategory::Browsing),
            ("Safari window with an article", "Safari", AppCategory::Browsing),
            ("Firefox developer tools open", "Firefox", AppCategory::Browsing),
            ("Slack thread in #general", "Slack", AppCategory::Communication),
            ("Discord voice channel", "Discord", AppCategory::Communication),
            ("Zoom call with four participants", "Zoom", AppCategory::Communication),
            ("Microsoft Teams standup", "Microsoft Teams", AppCategory::Communication),
            ("Notion page with meeting notes", "Notion", AppCategory::Documents),
            ("Obsidian vault graph view", "Obsidian", AppCategory::Documents),
            ("Google Docs draft", "Google Docs", AppCategory::Documents),
            ("Microsoft Word letter", "Microsoft Word", AppCategory::Documents),
            ("Figma canvas with components", "Figma", AppCategory::Design),
            ("Sketch artboard", "Sketch", AppCategory::Design),
            ("Photoshop layers panel", "Photoshop", AppCategory::Design),
            ("Gmail inbox with unread mail", "Gmail", AppCategory::Email),
            ("Outlook calendar invite", "Outlook", AppCategory::Email),
            ("YouTube video about woodworking", "YouTube", AppCategory::Entertainment),
            ("Netflix home screen", "Netflix", AppCategory::Entertainment),
            ("Spotify playing a playlist", "Spotify", AppCategory::Entertainment),
        ];

        for (text, app, category) in cases {
            let result = classifier.classify_scene(text);
            assert_eq!(result.app_name, app, "text: {text}");
            assert_eq!(result.category, category, "text: {text}");
        }
    }

    #[test]
    fn test_structured_pipe_pattern() {
        let classifier = SceneClassifier::new();
        let result = classifier.classify_scene("Figma | Editing components | design-system");
        assert_eq!(result.app_name, "Figma");
        assert_eq!(result.category, AppCategory::Design);
        assert_eq!(result.action.as_deref(), Some("Editing components"));
        assert_eq!(result.details.as_deref(), Some("design-system"));
    }

    #[test]
    fn test_structured_dash_pattern() {
        let classifier = SceneClassifier::new();
        let result = classifier.classify_scene("Slack - Replying to a thread - incident channel");
        assert_eq!(result.app_name, "Slack");
        assert_eq!(result.category, AppCategory::Communication);
        assert_eq!(result.action.as_deref(), Some("Replying to a thread"));
    }

    #[test]
    fn test_fallback_short_phrase() {
        let classifier = SceneClassifier::new();
        let result = classifier
            .classify_scene("An unrecognizable full screen game with pixel art\nsecond line");
        assert_eq!(result.category, AppCategory::Other);
        assert_eq!(result.app_name, "An unrecognizable full screen game");
        assert!(result.action.is_none());
    }

    #[test]
    fn test_classify_alert() {
        let classifier = SceneClassifier::new();
        let (app, category) = classifier.classify_alert("YouTube", "distraction_detected");
        assert_eq!(app, "YouTube");
        assert_eq!(category, AppCategory::Entertainment);

        let (app, category) = classifier.classify_alert("CustomTool", "focus_lost");
        assert_eq!(app, "CustomTool");
        assert_eq!(category, AppCategory::Other);

        let (app, _) = classifier.classify_alert("", "focus_lost");
        assert_eq!(app, "focus_lost");
    }

    #[test]
    fn test_action_priority_order() {
        let classifier = SceneClassifier::new();

        // Coding outranks watching even when both match.
        let texts = vec![
            "Watching a YouTube tutorial".to_string(),
            "Debugging in the terminal".to_string(),
        ];
        assert_eq!(classifier.infer_action(&texts), ActionTag::Coding);

        let texts = vec!["Watching a video playback".to_string()];
        assert_eq!(classifier.infer_action(&texts), ActionTag::Watching);

        assert_eq!(
            classifier.infer_action(&["Nothing recognizable".to_string()]),
            ActionTag::Working
        );
        assert_eq!(classifier.infer_action(&[]), ActionTag::Working);
    }

    #[test]
    fn test_project_from_ide_title() {
        let classifier = SceneClassifier::new();
        let texts = vec!["main.rs — recap — Visual Studio Code".to_string()];
        assert_eq!(classifier.infer_project(&texts).as_deref(), Some("recap"));
    }

    #[test]
    fn test_project_from_source_path() {
        let classifier = SceneClassifier::new();
        let texts = vec!["Terminal showing ~/dev/billing-engine/src/main.rs".to_string()];
        assert_eq!(
            classifier.infer_project(&texts).as_deref(),
            Some("billing-engine")
        );
    }

    #[test]
    fn test_project_validity_filter() {
        let classifier = SceneClassifier::new();

        // Domains, generic words and non-project folders are all rejected.
        let texts = vec!["docs.rs — Visual Studio Code".to_string()];
        assert_eq!(classifier.infer_project(&texts), None);

        let texts = vec!["untitled — Visual Studio Code".to_string()];
        assert_eq!(classifier.infer_project(&texts), None);

        let texts = vec!["Browsing home/src on a file server".to_string()];
        assert_eq!(classifier.infer_project(&texts), None);

        assert_eq!(classifier.infer_project(&[]), None);
    }

    #[test]
    fn test_first_valid_candidate_wins() {
        let classifier = SceneClassifier::new();
        let texts = vec![
            "untitled — Visual Studio Code".to_string(),
            "notes.md — fieldbook — Visual Studio Code".to_string(),
        ];
        assert_eq!(
            classifier.infer_project(&texts).as_deref(),
            Some("fieldbook")
        );
    }
}
