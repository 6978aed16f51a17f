//! Reasoning-effort heuristics.
//!
//! Produces an optional reasoning-intensity hint from request content. Two
//! stages: a fast-path screen that short-circuits trivial prompts to "no
//! hint", then a weighted score over content length, code density, domain
//! vocabulary, detected languages/frameworks and conversation depth. The
//! scoring is monotonic: adding complexity signals never lowers the level.

use crate::conversation::ConversationContext;
use crate::models::ReasoningEffort;
use once_cell::sync::Lazy;
use regex::Regex;

/// Content shorter than this never gets a reasoning hint.
const MIN_CONTENT_LEN: usize = 80;
/// Length past which content alone starts contributing to the score.
const LONG_CONTENT_LEN: usize = 600;
const VERY_LONG_CONTENT_LEN: usize = 2000;

static CODE_FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)```[a-zA-Z0-9_+-]*\n.*?```").expect("static regex"));

/// Keyword sets that push toward high effort: orchestration, distributed
/// systems and architecture vocabulary.
const ARCHITECTURE_KEYWORDS: &[&str] = &[
    "architecture",
    "microservice",
    "microservices",
    "distributed",
    "orchestration",
    "scalability",
    "event-driven",
    "saga",
    "consensus",
    "sharding",
    "replication",
    "load balanc",
    "service mesh",
    "fault toler",
    "high availability",
];

const ALGORITHMIC_KEYWORDS: &[&str] = &[
    "algorithm",
    "complexity",
    "optimize",
    "optimization",
    "dynamic programming",
    "graph traversal",
    "concurrency",
    "race condition",
    "deadlock",
    "lock-free",
    "big-o",
    "data structure",
];

const DEVOPS_KEYWORDS: &[&str] = &[
    "deployment",
    "ci/cd",
    "pipeline",
    "infrastructure",
    "provisioning",
    "observability",
    "autoscal",
    "rollout",
    "canary",
    "blue-green",
];

/// Single-file implementation vocabulary pushes toward low effort.
const SIMPLE_TASK_KEYWORDS: &[&str] = &[
    "rename",
    "typo",
    "one-liner",
    "single function",
    "small script",
    "quick fix",
    "format this",
    "convert this",
];

/// Fast-path prompt openers that never need a hint on a single line.
const TRIVIAL_OPENERS: &[&str] = &["complete", "explain", "what is", "define", "translate"];

struct LanguageProfile {
    name: &'static str,
    markers: &'static [&'static str],
    complexity_boost: u32,
    triggers_reasoning: bool,
}

struct FrameworkProfile {
    name: &'static str,
    markers: &'static [&'static str],
    complexity_boost: u32,
    triggers_reasoning: bool,
}

static LANGUAGES: Lazy<Vec<LanguageProfile>> = Lazy::new(|| {
    vec![
        LanguageProfile {
            name: "rust",
            markers: &["fn main", "impl ", "async fn", "borrow checker", " trait ", "cargo"],
            complexity_boost: 2,
            triggers_reasoning: true,
        },
        LanguageProfile {
            name: "python",
            markers: &["def ", "import ", "asyncio", "pandas", "numpy"],
            complexity_boost: 1,
            triggers_reasoning: true,
        },
        LanguageProfile {
            name: "typescript",
            markers: &["interface ", "const ", "=> {", "typescript", "tsconfig"],
            complexity_boost: 1,
            triggers_reasoning: true,
        },
        LanguageProfile {
            name: "go",
            markers: &["func ", "goroutine", "go.mod", "chan "],
            complexity_boost: 1,
            triggers_reasoning: true,
        },
        LanguageProfile {
            name: "java",
            markers: &["public class", "public static void", "@Override"],
            complexity_boost: 1,
            triggers_reasoning: true,
        },
        LanguageProfile {
            name: "sql",
            markers: &["select ", "join ", "group by", "create table"],
            complexity_boost: 1,
            triggers_reasoning: false,
        },
        LanguageProfile {
            name: "shell",
            markers: &["#!/bin/bash", "#!/bin/sh", "awk ", "sed ", "grep "],
            complexity_boost: 0,
            triggers_reasoning: false,
        },
    ]
});

static FRAMEWORKS: Lazy<Vec<FrameworkProfile>> = Lazy::new(|| {
    vec![
        FrameworkProfile {
            name: "kubernetes",
            markers: &["kubernetes", "k8s", "kubectl", "helm", "statefulset"],
            complexity_boost: 3,
            triggers_reasoning: true,
        },
        FrameworkProfile {
            name: "terraform",
            markers: &["terraform", "hcl", "tfstate"],
            complexity_boost: 2,
            triggers_reasoning: true,
        },
        FrameworkProfile {
            name: "kafka",
            markers: &["kafka", "consumer group", "partition rebalance"],
            complexity_boost: 3,
            triggers_reasoning: true,
        },
        FrameworkProfile {
            name: "react",
            markers: &["react", "usestate", "useeffect", "jsx"],
            complexity_boost: 1,
            triggers_reasoning: false,
        },
        FrameworkProfile {
            name: "actix",
            markers: &["actix", "axum", "tokio::spawn"],
            complexity_boost: 2,
            triggers_reasoning: true,
        },
        FrameworkProfile {
            name: "spring",
            markers: &["spring boot", "@autowired", "@restcontroller"],
            complexity_boost: 1,
            triggers_reasoning: true,
        },
    ]
});

/// Breakdown of the complexity signals behind a classification. Carried on
/// the processed request so the access log can record why a hint was chosen.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComplexityEstimate {
    pub score: u32,
    pub code_blocks: usize,
    pub languages: Vec<&'static str>,
    pub frameworks: Vec<&'static str>,
    pub architecture_hits: usize,
    pub conversation_depth: u64,
}

/// Analyze content and produce an optional reasoning hint.
///
/// `None` means no hint is attached to the canonical request; the backend
/// model decides on its own.
pub fn analyze(content: &str, context: Option<&ConversationContext>) -> Option<ReasoningEffort> {
    classify(content, context).1
}

/// Analyze content, returning the signal breakdown alongside the level.
pub fn classify(
    content: &str,
    context: Option<&ConversationContext>,
) -> (ComplexityEstimate, Option<ReasoningEffort>) {
    let trimmed = content.trim();

    // Fast-path screen. An optimization only: anything it skips would also
    // score below the minimal threshold in the weighted stage.
    if is_trivial(trimmed) {
        return (ComplexityEstimate::default(), None);
    }

    let estimate = score(trimmed, context);
    let level = level_for(&estimate, trimmed);
    (estimate, level)
}

fn is_trivial(content: &str) -> bool {
    if content.len() < MIN_CONTENT_LEN {
        return true;
    }
    let single_line = !content.contains('\n');
    if single_line {
        let lower = content.to_lowercase();
        if TRIVIAL_OPENERS.iter().any(|k| lower.starts_with(k)) {
            return true;
        }
    }
    false
}

fn count_hits(lower: &str, keywords: &[&str]) -> usize {
    keywords.iter().filter(|k| lower.contains(*k)).count()
}

fn score(content: &str, context: Option<&ConversationContext>) -> ComplexityEstimate {
    let lower = content.to_lowercase();
    let mut estimate = ComplexityEstimate {
        code_blocks: CODE_FENCE.find_iter(content).count(),
        conversation_depth: context.map(|c| c.message_count).unwrap_or(0),
        ..Default::default()
    };

    let mut score: u32 = 0;

    // Content length.
    if content.len() >= VERY_LONG_CONTENT_LEN {
        score += 3;
    } else if content.len() >= LONG_CONTENT_LEN {
        score += 1;
    }

    // Code density.
    score += match estimate.code_blocks {
        0 => 0,
        1 => 1,
        2 | 3 => 2,
        _ => 3,
    };

    // Domain vocabulary.
    estimate.architecture_hits = count_hits(&lower, ARCHITECTURE_KEYWORDS);
    score += (estimate.architecture_hits as u32).min(3) * 2;
    score += (count_hits(&lower, ALGORITHMIC_KEYWORDS) as u32).min(3);
    score += (count_hits(&lower, DEVOPS_KEYWORDS) as u32).min(2);

    // Languages and frameworks.
    for lang in LANGUAGES.iter() {
        if lang.markers.iter().any(|m| lower.contains(m)) {
            estimate.languages.push(lang.name);
            score += lang.complexity_boost;
        }
    }
    for fw in FRAMEWORKS.iter() {
        if fw.markers.iter().any(|m| lower.contains(m)) {
            estimate.frameworks.push(fw.name);
            score += fw.complexity_boost;
        }
    }

    // Polyglot requests are harder than the sum of their parts.
    if estimate.languages.len() >= 2 {
        score += 2;
    }
    if estimate.frameworks.len() >= 2 {
        score += 2;
    }

    // Deep conversations accumulate context worth deliberating over.
    if estimate.conversation_depth >= 10 {
        score += 2;
    } else if estimate.conversation_depth >= 4 {
        score += 1;
    }

    estimate.score = score;
    estimate
}

fn level_for(estimate: &ComplexityEstimate, content: &str) -> Option<ReasoningEffort> {
    let lower = content.to_lowercase();
    let simple_hits = count_hits(&lower, SIMPLE_TASK_KEYWORDS);

    // Languages/frameworks that never warrant reasoning at low complexity.
    let only_non_triggering = !estimate.languages.is_empty()
        && estimate
            .languages
            .iter()
            .all(|name| !triggers_reasoning_language(name))
        && estimate
            .frameworks
            .iter()
            .all(|name| !triggers_reasoning_framework(name));

    if only_non_triggering && estimate.score <= 3 {
        return None;
    }

    // Architecture plus a multi-framework stack resolves high even when the
    // raw score alone would land on medium.
    if estimate.architecture_hits > 0 && estimate.frameworks.len() >= 2 {
        return Some(ReasoningEffort::High);
    }

    let mut level = match estimate.score {
        0 | 1 => return None,
        2 | 3 => ReasoningEffort::Minimal,
        4 | 5 => ReasoningEffort::Low,
        6..=9 => ReasoningEffort::Medium,
        _ => ReasoningEffort::High,
    };

    // Single-file implementation vocabulary caps the level at Low.
    if simple_hits > 0 && level > ReasoningEffort::Low {
        level = ReasoningEffort::Low;
    }

    Some(level)
}

fn triggers_reasoning_language(name: &str) -> bool {
    LANGUAGES
        .iter()
        .find(|l| l.name == name)
        .map(|l| l.triggers_reasoning)
        .unwrap_or(false)
}

fn triggers_reasoning_framework(name: &str) -> bool {
    FRAMEWORKS
        .iter()
        .find(|f| f.name == name)
        .map(|f| f.triggers_reasoning)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context_with_depth(depth: u64) -> ConversationContext {
        let mut ctx = ConversationContext::new("conv-test");
        ctx.message_count = depth;
        ctx
    }

    #[test]
    fn short_content_yields_no_hint() {
        assert_eq!(analyze("hi", None), None);
        assert_eq!(analyze("write a haiku about rain", None), None);
    }

    #[test]
    fn trivial_openers_short_circuit() {
        let prompt = "explain what a hash map is and when I would want to use one in practice";
        assert_eq!(analyze(prompt, None), None);

        let prompt = "complete the following sentence for me because I cannot find a good ending";
        assert_eq!(analyze(prompt, None), None);
    }

    #[test]
    fn fast_path_is_consistent_with_scoring() {
        // Skipping the fast path must not change the outcome for content the
        // screen would have filtered.
        let prompt = "hi";
        let estimate = score(prompt, None);
        assert_eq!(level_for(&estimate, prompt), None);
    }

    #[test]
    fn architecture_vocabulary_pushes_high() {
        let prompt = "Design a distributed event-driven microservices architecture with \
                      saga-based orchestration, sharding for the write path, replication \
                      for reads, and consensus for the coordination layer. Discuss fault \
                      tolerance and high availability tradeoffs across regions.";
        assert_eq!(analyze(prompt, None), Some(ReasoningEffort::High));
    }

    #[test]
    fn architecture_plus_multiple_frameworks_resolves_high() {
        // Each factor alone would justify medium at most.
        let prompt = "Review this architecture: a react frontend talking to services \
                      deployed on kubernetes, with kafka between them for events. \
                      What should I watch out for when a partition rebalance happens?";
        let (estimate, level) = classify(prompt, None);
        assert!(estimate.frameworks.len() >= 2);
        assert!(estimate.architecture_hits >= 1);
        assert_eq!(level, Some(ReasoningEffort::High));
    }

    #[test]
    fn simple_task_vocabulary_caps_low() {
        let prompt = "Quick fix needed: rename this variable in my python def process() \
                      function, import statements stay as they are. It is a small script, \
                      nothing else should change in the file at all.";
        let level = analyze(prompt, None);
        assert!(level.is_none() || level <= Some(ReasoningEffort::Low));
    }

    #[test]
    fn non_triggering_language_at_low_complexity_yields_none() {
        let prompt = "Here is a bash thing: grep the log file, pipe through awk to pull \
                      the third column, then sed the hostname out of every line please.";
        let (estimate, level) = classify(prompt, None);
        assert_eq!(estimate.languages, vec!["shell"]);
        assert_eq!(level, None);
    }

    #[test]
    fn code_blocks_raise_the_level() {
        let base = "Please review this change and tell me whether the error handling is \
                    sound, and whether the retries can starve the worker pool under load.";
        let with_code = format!(
            "{base}\n```rust\nasync fn run() {{ tokio::spawn(work()); }}\n```\n\
             ```rust\nimpl Worker {{ fn drain(&mut self) {{}} }}\n```"
        );
        let (plain, _) = classify(base, None);
        let (coded, _) = classify(&with_code, None);
        assert!(coded.score > plain.score);
        assert_eq!(coded.code_blocks, 2);
    }

    #[test]
    fn conversation_depth_contributes() {
        let prompt = "Given everything we discussed, outline the concurrency model for \
                      the ingestion service and where the race condition could appear \
                      when two writers share one queue under sustained load conditions.";
        let shallow = classify(prompt, None).0.score;
        let deep = classify(prompt, Some(&context_with_depth(12))).0.score;
        assert!(deep > shallow);
    }

    #[test]
    fn scoring_is_monotonic_in_signals() {
        let medium = "Optimize this algorithm for lower complexity; the graph traversal \
                      currently revisits nodes and the data structure choice seems wrong \
                      for the access pattern we actually have in production workloads.";
        let more = format!(
            "{medium} The service runs on kubernetes and publishes to kafka, and the \
             deployment pipeline does a canary rollout across three clusters."
        );
        let (a, la) = classify(medium, None);
        let (b, lb) = classify(&more, None);
        assert!(b.score >= a.score);
        assert!(lb >= la);
    }
}
