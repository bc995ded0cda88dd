//! AnswerComposer: doctype-specific prompt assembly, LLM invocation, and
//! citation-enforced answer composition. Grounded in the reference
//! structured-output scanner and citation validator, reimplemented for the
//! fixed doctype set this core actually serves.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::LazyLock;

use crate::config::LlmConfig;
use crate::llm::{ChatMessage, LlmClient};
use crate::types::{Chunk, Doctype};

static AMOUNT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(합계|총액|견적|금액)[^\d]{0,10}([\d,]+\s*(?:억|만)?\s*원?)").unwrap()
});
static DECISION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(선정|결정|조치|확정|권고|채택|승인)").unwrap());
static BULKY_CONTEXT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(품목|구매|금액)").unwrap());
static LINE_FILTER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{4}[-./]\d{1,2}[-./]\d{1,2}|[\d,]+\s*원|합계|총액|견적|구매|납품)").unwrap()
});

static MINUTES_KEYWORDS: &[&str] = &["참석자", "안건", "결정"];
static PROC_EVAL_KEYWORDS: &[&str] = &["예산합계", "비교대안", "선정권고", "배경목적"];
static CONSUMABLES_KEYWORDS: &[&str] = &["소모품", "구매", "납품", "품목"];
static REPAIR_KEYWORDS: &[&str] = &["고장", "수리", "보수", "장비", "증상"];
static DISPOSAL_KEYWORDS: &[&str] = &["폐기", "매각", "불용"];

static CITATION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"\[[^\[\]]+\.(?:pdf|hwp|docx?|xlsx?)\]").unwrap(),
        Regex::new(r"「[^」]+\.(?:pdf|hwp|docx?|xlsx?)」").unwrap(),
        Regex::new(r"출처\s*[:：][^\n]+").unwrap(),
        Regex::new(r"근거\s*[:：][^\n]+").unwrap(),
    ]
});

static NEGATIVE_PHRASES: &[&str] = &["찾을 수 없", "확인할 수 없"];

/// The fixed reply for a chunk-less query when ungrounded chat is disabled
/// — see Testable Property 8 (`SPEC_FULL.md` §8): this string is reserved
/// for the empty-evidence path and must never appear when `chunks` is
/// non-empty.
pub const NO_DOCUMENTS_REPLY: &str = "검색된 관련 문서가 없습니다.";

/// Detect the doctype of a document from its filename and body text,
/// following the fixed precedence order: minutes (>= 2 of 참석자/안건/결정)
/// beats proc_eval before consumables (both contain 구매), then repair,
/// then disposal; generic is the fallback.
pub fn detect_doctype(filename: &str, body: &str) -> Doctype {
    let window: String = body.chars().take(2000).collect();
    let haystack = format!("{filename} {window}");

    let minutes_hits = MINUTES_KEYWORDS.iter().filter(|k| haystack.contains(*k)).count();
    if minutes_hits >= 2 {
        return Doctype::Minutes;
    }
    if PROC_EVAL_KEYWORDS.iter().any(|k| haystack.contains(k)) {
        return Doctype::ProcEval;
    }
    if CONSUMABLES_KEYWORDS.iter().any(|k| haystack.contains(k)) {
        return Doctype::Consumables;
    }
    if REPAIR_KEYWORDS.iter().any(|k| haystack.contains(k)) {
        return Doctype::Repair;
    }
    if DISPOSAL_KEYWORDS.iter().any(|k| haystack.contains(k)) {
        return Doctype::Disposal;
    }
    Doctype::Generic
}

/// Re-scan a window of text for amount-adjacent tokens, used to reconfirm a
/// pre-extracted `claimed_total` rather than trust it blindly.
fn rescan_amounts(text: &str) -> Vec<String> {
    AMOUNT_PATTERN
        .captures_iter(text)
        .map(|c| c.get(2).map(|m| m.as_str().trim().to_string()).unwrap_or_default())
        .filter(|s| !s.is_empty())
        .take(5)
        .collect()
}

fn has_decision_present(text: &str) -> bool {
    DECISION_PATTERN.is_match(text)
}

fn doctype_field_schema(doctype: Doctype) -> &'static [&'static str] {
    match doctype {
        Doctype::Consumables => &["제목", "요약", "구매목적", "품목", "총액", "예산계정", "납품장소", "비고", "증거"],
        Doctype::Repair => &["제목", "요약", "장비정보", "증상", "원인", "조치", "결과검증", "비용상세", "긴급도", "증거"],
        Doctype::ProcEval => &["제목", "예산합계", "배경목적", "비교대안", "선정권고"],
        Doctype::Disposal => &["제목", "요약", "폐기사유", "폐기대상", "폐기방법", "증거"],
        Doctype::Minutes => &["제목", "요약", "참석자", "주요안건", "결정사항", "액션아이템", "증거"],
        _ => &["제목", "요약", "목적배경", "주요내용", "결론조치", "예산", "증거"],
    }
}

fn doctype_label(doctype: Doctype) -> &'static str {
    match doctype {
        Doctype::Consumables => "소모품 구매 문서",
        Doctype::Repair => "수리/보수 문서",
        Doctype::ProcEval => "구매 검토 문서",
        Doctype::Disposal => "폐기 문서",
        Doctype::Minutes => "회의록",
        _ => "일반 문서",
    }
}

/// Build the prompt the LLM sees: document identity, packed context chunks,
/// the doctype's JSON field schema, and the hard output instructions.
fn build_prompt(query: &str, doctype: Doctype, primary: Option<&Chunk>, chunks: &[Chunk]) -> Vec<ChatMessage> {
    let bulky = BULKY_CONTEXT_PATTERN.is_match(query);

    let mut context = String::new();
    for chunk in chunks {
        let packed = if bulky {
            chunk.text.chars().take(3000).collect::<String>()
        } else {
            chunk
                .text
                .lines()
                .filter(|line| LINE_FILTER_PATTERN.is_match(line))
                .collect::<Vec<_>>()
                .join("\n")
        };
        context.push_str(&format!("[{}] (관련도 {:.2})\n{}\n\n", chunk.filename, chunk.score, packed));
    }

    let mut identity = String::new();
    if let Some(doc) = primary {
        identity.push_str(&format!("문서명: {}\n", doc.filename));
        if let Some(drafter) = &doc.drafter {
            identity.push_str(&format!("작성자: {drafter}\n"));
        }
        if let Some(date) = &doc.date {
            identity.push_str(&format!("작성일: {date}\n"));
        }
        let amounts = rescan_amounts(&doc.text);
        if !amounts.is_empty() {
            identity.push_str(&format!("문서 내 금액 표기: {}\n", amounts.join(", ")));
        }
        if has_decision_present(&doc.text) {
            identity.push_str("결정/조치 사항이 문서에 포함되어 있음\n");
        }
    }

    let schema = doctype_field_schema(doctype);
    let schema_json = schema
        .iter()
        .map(|field| format!("  \"{field}\": \"...\""))
        .collect::<Vec<_>>()
        .join(",\n");

    let system = format!(
        "당신은 {}을(를) 분석하는 업무 보조원입니다.\n\
         반드시 문서에 실제로 존재하는 사실만 사용하십시오.\n\
         답변에는 반드시 근거가 된 파일명을 `[파일명.pdf]` 형식으로 인용하십시오.\n\
         문서와 동일한 언어로 답변하십시오.\n\
         다음 JSON 스키마를 따르는 fenced ```json 블록으로만 응답하십시오:\n```json\n{{\n{schema_json}\n}}\n```",
        doctype_label(doctype)
    );

    vec![
        ChatMessage::system(system),
        ChatMessage::user(format!("{identity}\n질문: {query}\n\n참고 문서:\n{context}")),
    ]
}

/// Scan `text` for the first balanced `{...}` object, preferring a fenced
/// ```json block when present. Mirrors the reference brace-depth scanner.
pub fn extract_json_object(text: &str) -> Option<String> {
    let search_space = if let Some(start) = text.find("```json") {
        let after = &text[start + 7..];
        if let Some(end) = after.find("```") {
            &after[..end]
        } else {
            after
        }
    } else {
        text
    };

    let bytes = search_space.as_bytes();
    let start = bytes.iter().position(|&b| b == b'{')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(search_space[start..=i].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Lenient parse fallback: strips trailing commas before the closing
/// bracket/brace, which some LLM outputs include despite instructions.
fn lenient_parse(json_text: &str) -> Option<Value> {
    serde_json::from_str(json_text).ok().or_else(|| {
        let cleaned = Regex::new(r",(\s*[}\]])").unwrap().replace_all(json_text, "$1");
        serde_json::from_str(&cleaned).ok()
    })
}

#[derive(Debug, Clone)]
struct CitationCheck {
    has_citation: bool,
    cited_filenames: Vec<String>,
}

fn check_citations(answer: &str, known_filenames: &[String]) -> CitationCheck {
    let mut cited = Vec::new();
    for pattern in CITATION_PATTERNS.iter() {
        for m in pattern.find_iter(answer) {
            for filename in known_filenames {
                if m.as_str().contains(filename.as_str()) && !cited.contains(filename) {
                    cited.push(filename.clone());
                }
            }
        }
    }
    CitationCheck { has_citation: !cited.is_empty(), cited_filenames: cited }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposedAnswer {
    pub doctype: String,
    pub structured: Option<Value>,
    pub markdown: String,
    pub has_proper_citation: bool,
    pub cited_filenames: Vec<String>,
    pub confidence: f32,
}

pub struct AnswerComposer {
    llm: LlmClient,
    max_retry: u32,
}

impl AnswerComposer {
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        Ok(Self { llm: LlmClient::new(config)?, max_retry: config.max_retry })
    }

    /// `allow_ungrounded_chat` governs the empty-evidence path (§4.9, §7
    /// `SearchError` propagation policy): with no chunks and the flag off,
    /// the composer never calls the LLM and returns the fixed
    /// [`NO_DOCUMENTS_REPLY`]; with it on, the LLM answers free-form and
    /// citation enforcement is skipped (there is nothing to cite).
    pub async fn compose(
        &self,
        query: &str,
        chunks: &[Chunk],
        allow_ungrounded_chat: bool,
    ) -> anyhow::Result<ComposedAnswer> {
        if chunks.is_empty() {
            if !allow_ungrounded_chat {
                return Ok(ComposedAnswer {
                    doctype: Doctype::Generic.as_str().to_string(),
                    structured: None,
                    markdown: NO_DOCUMENTS_REPLY.to_string(),
                    has_proper_citation: false,
                    cited_filenames: Vec::new(),
                    confidence: 0.0,
                });
            }
            return Ok(self.compose_ungrounded(query).await);
        }

        let known_filenames: Vec<String> = chunks.iter().map(|c| c.filename.clone()).collect();
        let primary = chunks.first();
        let doctype = primary
            .map(|c| detect_doctype(&c.filename, &c.text))
            .unwrap_or(Doctype::Generic);

        let messages = build_prompt(query, doctype, primary, chunks);

        let mut raw_answer: Option<String> = None;
        for attempt in 0..=self.max_retry {
            match self.llm.complete(&messages, 0.1).await {
                Ok(text) => {
                    let check = check_citations(&text, &known_filenames);
                    if check.has_citation {
                        raw_answer = Some(text);
                        break;
                    }
                    tracing::info!(attempt, "llm answer missing citation, retrying");
                    raw_answer = Some(text);
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "llm call failed during composition");
                }
            }
        }

        match raw_answer {
            Some(text) => Ok(self.finalize(text, doctype, chunks, &known_filenames)),
            None => Ok(self.degrade(doctype, chunks, &known_filenames)),
        }
    }

    /// Free-form answer with no retrieved evidence, allowed only when
    /// `cache.allow_ungrounded_chat` is set. No citation enforcement applies
    /// since there is no chunk set to cite.
    async fn compose_ungrounded(&self, query: &str) -> ComposedAnswer {
        let messages = vec![
            ChatMessage::system(
                "문서 검색 결과가 없습니다. 일반 지식으로 간단히 답변하되, \
                 문서에서 찾은 것처럼 단정하지 마십시오."
                    .to_string(),
            ),
            ChatMessage::user(query.to_string()),
        ];
        let markdown = match self.llm.complete(&messages, 0.3).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "ungrounded llm call failed");
                NO_DOCUMENTS_REPLY.to_string()
            }
        };
        ComposedAnswer {
            doctype: Doctype::Generic.as_str().to_string(),
            structured: None,
            markdown,
            has_proper_citation: false,
            cited_filenames: Vec::new(),
            confidence: 0.2,
        }
    }

    fn finalize(&self, raw: String, doctype: Doctype, chunks: &[Chunk], known_filenames: &[String]) -> ComposedAnswer {
        let structured = extract_json_object(&raw).and_then(|s| lenient_parse(&s));
        let mut check = check_citations(&raw, known_filenames);
        let mut markdown = raw.clone();

        if !check.has_citation && !chunks.is_empty() {
            let top_two: Vec<String> = chunks.iter().take(2).map(|c| format!("[{}]", c.filename)).collect();
            markdown.push_str(&format!("\n\n출처: {}", top_two.join(" ")));
            check = CitationCheck {
                has_citation: false,
                cited_filenames: chunks.iter().take(2).map(|c| c.filename.clone()).collect(),
            };
        }

        let rendered = structured
            .as_ref()
            .map(|v| render_markdown(v, primary_date_drafter(chunks)))
            .unwrap_or(markdown);

        let confidence = compute_confidence(chunks, &check, &raw);

        ComposedAnswer {
            doctype: doctype.as_str().to_string(),
            structured,
            markdown: rendered,
            has_proper_citation: check.has_citation,
            cited_filenames: check.cited_filenames,
            confidence,
        }
    }

    /// Never return "no information" when at least one chunk was retrieved:
    /// build a basic summary from up to three chunks' leading text.
    fn degrade(&self, doctype: Doctype, chunks: &[Chunk], _known_filenames: &[String]) -> ComposedAnswer {
        let mut markdown = String::new();
        for chunk in chunks.iter().take(3) {
            let snippet: String = chunk.text.chars().take(200).collect();
            markdown.push_str(&format!("- [{}] {}\n", chunk.filename, snippet));
        }
        let sources: Vec<String> = chunks.iter().take(2).map(|c| format!("[{}]", c.filename)).collect();
        markdown.push_str(&format!("\n출처: {}", sources.join(" ")));

        ComposedAnswer {
            doctype: doctype.as_str().to_string(),
            structured: None,
            markdown,
            has_proper_citation: false,
            cited_filenames: chunks.iter().take(2).map(|c| c.filename.clone()).collect(),
            confidence: 0.3,
        }
    }
}

fn primary_date_drafter(chunks: &[Chunk]) -> (Option<String>, Option<String>) {
    chunks.first().map(|c| (c.drafter.clone(), c.date.clone())).unwrap_or((None, None))
}

/// Render only the sections the parsed JSON actually populated, appended
/// with a `문서 정보` footer naming drafter and date.
fn render_markdown(value: &Value, drafter_date: (Option<String>, Option<String>)) -> String {
    let mut out = String::new();
    if let Value::Object(map) = value {
        // Preserve insertion order as returned by the LLM/serde_json.
        let ordered: Vec<(&String, &Value)> = map.iter().collect();
        for (key, val) in ordered {
            let rendered = render_value(val);
            if rendered.trim().is_empty() {
                continue;
            }
            out.push_str(&format!("## {key}\n{rendered}\n\n"));
        }
    }

    let (drafter, date) = drafter_date;
    if drafter.is_some() || date.is_some() {
        out.push_str("---\n문서 정보: ");
        if let Some(d) = drafter {
            out.push_str(&format!("작성자 {d} "));
        }
        if let Some(d) = date {
            out.push_str(&format!("작성일 {d}"));
        }
        out.push('\n');
    }
    out
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|v| format!("- {}", render_value(v)))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Combines top-chunk score, citation presence/count, a length penalty, and
/// a penalty for negative phrases into a single confidence scalar in [0, 1].
fn compute_confidence(chunks: &[Chunk], citation: &CitationCheck, answer: &str) -> f32 {
    let top_score = chunks.first().map(|c| c.score).unwrap_or(0.0).min(1.0).max(0.0);
    let mut score = 0.4 * top_score;

    score += if citation.has_citation { 0.3 } else { 0.0 };
    score += (citation.cited_filenames.len().min(3) as f32) * 0.03;

    let len = answer.chars().count();
    if len < 20 {
        score -= 0.2;
    } else if len > 4000 {
        score -= 0.1;
    } else {
        score += 0.2;
    }

    if NEGATIVE_PHRASES.iter().any(|p| answer.contains(p)) {
        score -= 0.3;
    }

    score.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(filename: &str, text: &str, score: f32) -> Chunk {
        Chunk {
            doc_id: crate::types::DocId(1),
            page: None,
            text: text.to_string(),
            score,
            filename: filename.to_string(),
            date: Some("2024-10-24".to_string()),
            drafter: Some("남준수".to_string()),
            category: None,
            author_matched: false,
        }
    }

    #[test]
    fn detect_doctype_prefers_minutes_on_two_keyword_hits() {
        let dt = detect_doctype("회의.pdf", "참석자: 홍길동\n안건: 예산\n결정: 승인");
        assert_eq!(dt, Doctype::Minutes);
    }

    #[test]
    fn detect_doctype_disambiguates_proc_eval_from_consumables() {
        let dt = detect_doctype("검토.pdf", "예산합계 비교대안 선정권고 구매");
        assert_eq!(dt, Doctype::ProcEval);
    }

    #[test]
    fn detect_doctype_consumables_without_proc_eval_keywords() {
        let dt = detect_doctype("구매.pdf", "소모품 구매 납품 품목 내역");
        assert_eq!(dt, Doctype::Consumables);
    }

    #[test]
    fn detect_doctype_falls_back_to_generic() {
        let dt = detect_doctype("unrelated.pdf", "아무 관련 없는 내용입니다");
        assert_eq!(dt, Doctype::Generic);
    }

    #[test]
    fn extract_json_object_from_fenced_block() {
        let text = "설명\n```json\n{\"제목\": \"테스트\", \"값\": 1}\n```\n끝";
        let extracted = extract_json_object(text).unwrap();
        let parsed: Value = serde_json::from_str(&extracted).unwrap();
        assert_eq!(parsed["제목"], "테스트");
    }

    #[test]
    fn extract_json_object_handles_nested_braces() {
        let text = "{\"a\": {\"b\": 1}, \"c\": [1,2]}";
        let extracted = extract_json_object(text).unwrap();
        assert_eq!(extracted, text);
    }

    #[test]
    fn lenient_parse_tolerates_trailing_comma() {
        let text = r#"{"a": 1, "b": 2,}"#;
        assert!(lenient_parse(text).is_some());
    }

    #[test]
    fn check_citations_matches_bracketed_filename() {
        let known = vec!["2024-10-24_보수건.pdf".to_string()];
        let result = check_citations("근거는 [2024-10-24_보수건.pdf] 입니다.", &known);
        assert!(result.has_citation);
        assert_eq!(result.cited_filenames, vec!["2024-10-24_보수건.pdf".to_string()]);
    }

    #[test]
    fn check_citations_no_match_returns_false() {
        let known = vec!["a.pdf".to_string()];
        let result = check_citations("인용이 없는 답변입니다.", &known);
        assert!(!result.has_citation);
    }

    #[tokio::test]
    async fn no_chunks_and_ungrounded_disallowed_returns_fixed_reply() {
        let composer = AnswerComposer {
            llm: crate::llm::LlmClient::new(&LlmConfig {
                endpoint: "http://127.0.0.1:1/v1/chat/completions".to_string(),
                max_retry: 0,
                max_context_tokens: 100,
                max_response_tokens: 100,
                request_timeout_secs: 1,
            })
            .unwrap(),
            max_retry: 0,
        };
        let composed = composer.compose("아무 질문", &[], false).await.unwrap();
        assert_eq!(composed.markdown, NO_DOCUMENTS_REPLY);
        assert!(!composed.has_proper_citation);
    }

    #[test]
    fn confidence_penalized_by_negative_phrase() {
        let chunks = vec![chunk("a.pdf", "내용", 0.9)];
        let citation = CitationCheck { has_citation: true, cited_filenames: vec!["a.pdf".to_string()] };
        let normal = compute_confidence(&chunks, &citation, "정상적인 답변입니다 이것은 충분히 긴 답변입니다");
        let negative = compute_confidence(&chunks, &citation, "찾을 수 없습니다 이것은 충분히 긴 답변입니다요");
        assert!(negative < normal);
    }
}
