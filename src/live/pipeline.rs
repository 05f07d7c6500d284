//! Transcript pipeline: sentence assembly, input debounce, and the
//! script/echo filters.
//!
//! The provider emits transcription text in small partial chunks on both
//! directions. This module turns those chunks into the finalized
//! sentences the rest of the server operates on:
//!
//! - **Output (AI speech)**: chunks accumulate in a buffer and a whole
//!   sentence is emitted when it ends in `. ! ?`; `turnComplete` flushes
//!   any residue. Each sentence passes through a cleaner that strips
//!   bracketed/starred meta-commentary before anyone sees it.
//! - **Input (caller speech)**: chunks accumulate in a debounce buffer
//!   and are finalized after a quiet period (or immediately on
//!   `turnComplete`). Finalized text must survive the script filter
//!   (no Indic-script characters, ≥30% ASCII letters) and the echo
//!   filter (no containment match against the AI's recent sentences)
//!   before it counts as something the caller actually said.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

// ── Sentence cleaner ───────────────────────────────────────────────

/// Strip non-greedy delimited spans, e.g. `[clears throat]` or `*sighs*`.
fn strip_spans(s: &str, open: char, close: char) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find(open) {
        let after = start + open.len_utf8();
        match rest[after..].find(close) {
            Some(end_rel) => {
                out.push_str(&rest[..start]);
                rest = &rest[after + end_rel + close.len_utf8()..];
            }
            None => break,
        }
    }
    out.push_str(rest);
    out
}

/// Remove meta-commentary tokens the model sometimes emits around its
/// speech, then normalize whitespace.
pub fn clean_sentence(raw: &str) -> String {
    let without_brackets = strip_spans(raw, '[', ']');
    let without_stars = strip_spans(&without_brackets, '*', '*');
    without_stars.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ── Script filter ──────────────────────────────────────────────────

/// Unicode blocks of the Indic scripts the transcription model is known
/// to hallucinate on noisy line audio.
const INDIC_RANGES: &[(u32, u32)] = &[
    (0x0900, 0x097F), // Devanagari
    (0x0980, 0x09FF), // Bengali
    (0x0A80, 0x0AFF), // Gujarati
    (0x0B00, 0x0B7F), // Oriya
    (0x0C00, 0x0C7F), // Telugu
    (0x0C80, 0x0CFF), // Kannada
    (0x0D00, 0x0D7F), // Malayalam
];

/// Minimum ratio of ASCII letters to non-whitespace characters.
const MIN_ASCII_RATIO: f64 = 0.30;

/// Accept only text that is plausibly English caller speech.
///
/// Rejects empty/whitespace candidates, anything containing a character
/// from an Indic script block, and text whose ASCII-letter ratio falls
/// below 30% of its non-whitespace characters.
pub fn passes_script_filter(text: &str) -> bool {
    let mut ascii_letters = 0u32;
    let mut non_whitespace = 0u32;

    for c in text.chars() {
        let cp = c as u32;
        if INDIC_RANGES.iter().any(|&(lo, hi)| (lo..=hi).contains(&cp)) {
            return false;
        }
        if c.is_whitespace() {
            continue;
        }
        non_whitespace += 1;
        if c.is_ascii_alphabetic() {
            ascii_letters += 1;
        }
    }

    if non_whitespace == 0 {
        return false;
    }
    f64::from(ascii_letters) / f64::from(non_whitespace) >= MIN_ASCII_RATIO
}

// ── Echo filter ────────────────────────────────────────────────────

/// Lowercase and drop ASCII punctuation for containment comparison.
pub fn normalize_for_echo(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_ascii_punctuation())
        .flat_map(char::to_lowercase)
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Ring of the AI's recently spoken sentences, used to reject the
/// transcription model re-hearing the agent through the caller's mic.
pub struct EchoRing {
    window: Duration,
    entries: VecDeque<(String, Instant)>,
}

impl EchoRing {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: VecDeque::new(),
        }
    }

    fn evict(&mut self, now: Instant) {
        while let Some((_, at)) = self.entries.front() {
            if now.duration_since(*at) > self.window {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record a sentence the AI just finished speaking.
    pub fn record(&mut self, sentence: &str, now: Instant) {
        self.evict(now);
        let normalized = normalize_for_echo(sentence);
        if !normalized.is_empty() {
            self.entries.push_back((normalized, now));
        }
    }

    /// Bidirectional containment test against every live entry.
    pub fn suppresses(&mut self, candidate: &str, now: Instant) -> bool {
        self.evict(now);
        let normalized = normalize_for_echo(candidate);
        if normalized.is_empty() {
            return false;
        }
        self.entries
            .iter()
            .any(|(ai, _)| normalized.contains(ai.as_str()) || ai.contains(normalized.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── Output sentence assembly ───────────────────────────────────────

/// Accumulates output-transcript chunks and emits whole sentences.
#[derive(Default)]
pub struct SentenceAssembler {
    buffer: String,
}

impl SentenceAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk; return any sentences completed by it.
    ///
    /// A sentence ends at `. ! ?` followed by whitespace or end of
    /// buffer, which keeps decimals like "3.5" intact.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);

        let mut sentences = Vec::new();
        let mut consumed = 0;
        let bytes: Vec<(usize, char)> = self.buffer.char_indices().collect();
        for (i, &(pos, c)) in bytes.iter().enumerate() {
            if matches!(c, '.' | '!' | '?') {
                let at_end = i + 1 == bytes.len();
                let followed_by_space = bytes.get(i + 1).is_some_and(|&(_, n)| n.is_whitespace());
                if at_end || followed_by_space {
                    let end = pos + c.len_utf8();
                    let sentence = self.buffer[consumed..end].trim();
                    if !sentence.is_empty() {
                        sentences.push(sentence.to_string());
                    }
                    consumed = end;
                }
            }
        }
        if consumed > 0 {
            self.buffer.drain(..consumed);
        }
        sentences
    }

    /// Emit whatever remains (turn completion).
    pub fn flush(&mut self) -> Option<String> {
        let residual = self.buffer.trim().to_string();
        self.buffer.clear();
        if residual.is_empty() {
            None
        } else {
            Some(residual)
        }
    }

    /// Discard the buffer (model interrupted mid-sentence).
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

// ── Input debounce ─────────────────────────────────────────────────

/// Accumulates input-transcript chunks until the caller goes quiet.
pub struct InputDebouncer {
    window: Duration,
    buffer: String,
    deadline: Option<Instant>,
}

impl InputDebouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            buffer: String::new(),
            deadline: None,
        }
    }

    pub fn push(&mut self, chunk: &str, now: Instant) {
        self.buffer.push_str(chunk);
        self.deadline = Some(now + self.window);
    }

    /// When the pending buffer should be finalized, if any.
    pub fn deadline(&self) -> Option<Instant> {
        if self.buffer.trim().is_empty() {
            None
        } else {
            self.deadline
        }
    }

    /// Take the buffer if the quiet period has elapsed.
    pub fn take_due(&mut self, now: Instant) -> Option<String> {
        match self.deadline {
            Some(deadline) if now >= deadline => self.take(),
            _ => None,
        }
    }

    /// Take the buffer unconditionally (turn completion).
    pub fn take(&mut self) -> Option<String> {
        self.deadline = None;
        let text = std::mem::take(&mut self.buffer);
        let trimmed = text.trim().to_string();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    }
}

// ── Combined pipeline ──────────────────────────────────────────────

/// Why a finalized input candidate was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputRejection {
    /// Failed the Indic-script / ASCII-ratio check.
    Script,
    /// Matched a recent AI sentence (agent audio leaking into the mic).
    Echo,
}

/// A finalized caller utterance, accepted or rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizedInput {
    Accepted(String),
    Rejected {
        text: String,
        reason: InputRejection,
    },
}

/// The per-binding transcription state machine.
pub struct TranscriptPipeline {
    assembler: SentenceAssembler,
    debouncer: InputDebouncer,
    echoes: EchoRing,
}

impl TranscriptPipeline {
    pub fn new(debounce: Duration, echo_window: Duration) -> Self {
        Self {
            assembler: SentenceAssembler::new(),
            debouncer: InputDebouncer::new(debounce),
            echoes: EchoRing::new(echo_window),
        }
    }

    /// Feed an output-transcript chunk. Returns cleaned, finalized AI
    /// sentences; each is recorded in the echo ring.
    pub fn push_output_chunk(&mut self, chunk: &str, now: Instant) -> Vec<String> {
        let raw = self.assembler.push(chunk);
        self.finalize_output(raw, now)
    }

    /// Feed an input-transcript chunk (re-arms the debounce window).
    pub fn push_input_chunk(&mut self, chunk: &str, now: Instant) {
        self.debouncer.push(chunk, now);
    }

    /// Deadline at which [`Self::finalize_due_input`] will produce.
    pub fn input_deadline(&self) -> Option<Instant> {
        self.debouncer.deadline()
    }

    /// Finalize the pending input if its quiet period elapsed.
    pub fn finalize_due_input(&mut self, now: Instant) -> Option<FinalizedInput> {
        let text = self.debouncer.take_due(now)?;
        Some(self.filter_input(text, now))
    }

    /// Turn completion: flush the residual AI sentence and any pending
    /// input immediately, debounce notwithstanding.
    pub fn flush_turn(&mut self, now: Instant) -> (Vec<String>, Option<FinalizedInput>) {
        let residual = self.assembler.flush();
        let sentences = self.finalize_output(residual.into_iter().collect(), now);
        let input = self.debouncer.take().map(|t| self.filter_input(t, now));
        (sentences, input)
    }

    /// Model interrupted: discard the half-spoken sentence.
    pub fn clear_output(&mut self) {
        self.assembler.clear();
    }

    fn finalize_output(&mut self, raw: Vec<String>, now: Instant) -> Vec<String> {
        let mut out = Vec::with_capacity(raw.len());
        for sentence in raw {
            let cleaned = clean_sentence(&sentence);
            if cleaned.is_empty() {
                continue;
            }
            self.echoes.record(&cleaned, now);
            out.push(cleaned);
        }
        out
    }

    fn filter_input(&mut self, text: String, now: Instant) -> FinalizedInput {
        if !passes_script_filter(&text) {
            return FinalizedInput::Rejected {
                text,
                reason: InputRejection::Script,
            };
        }
        if self.echoes.suppresses(&text, now) {
            return FinalizedInput::Rejected {
                text,
                reason: InputRejection::Echo,
            };
        }
        FinalizedInput::Accepted(text)
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const DEBOUNCE: Duration = Duration::from_millis(400);
    const ECHO_WINDOW: Duration = Duration::from_secs(10);

    fn pipeline() -> TranscriptPipeline {
        TranscriptPipeline::new(DEBOUNCE, ECHO_WINDOW)
    }

    // ── cleaner ────────────────────────────────────────────────────

    #[test]
    fn cleaner_strips_bracketed_and_starred_tokens() {
        assert_eq!(
            clean_sentence("[clears throat] Sure, *warmly* I can help."),
            "Sure, I can help."
        );
        assert_eq!(clean_sentence("Hello there."), "Hello there.");
    }

    #[test]
    fn cleaner_leaves_unclosed_delimiters_alone() {
        assert_eq!(clean_sentence("price is 5 * 3 dollars."), "price is 5 * 3 dollars.");
        assert_eq!(clean_sentence("see [attachment"), "see [attachment");
    }

    #[test]
    fn cleaner_collapses_whitespace() {
        assert_eq!(clean_sentence("  too   many  spaces "), "too many spaces");
    }

    // ── sentence assembly ──────────────────────────────────────────

    #[test]
    fn assembler_emits_on_terminal_punctuation() {
        let mut asm = SentenceAssembler::new();
        assert!(asm.push("Hel").is_empty());
        assert!(asm.push("lo there").is_empty());
        assert_eq!(asm.push(". "), vec!["Hello there."]);
    }

    #[test]
    fn assembler_splits_mid_chunk_boundaries() {
        let mut asm = SentenceAssembler::new();
        let got = asm.push("First one. Second one! And a tail");
        assert_eq!(got, vec!["First one.", "Second one!"]);
        assert_eq!(asm.flush().as_deref(), Some("And a tail"));
    }

    #[test]
    fn assembler_keeps_decimals_together() {
        let mut asm = SentenceAssembler::new();
        assert!(asm.push("that costs 3.5").is_empty());
        assert_eq!(asm.push("0 dollars. "), vec!["that costs 3.50 dollars."]);
    }

    #[test]
    fn assembler_flush_empty_is_none() {
        let mut asm = SentenceAssembler::new();
        assert_eq!(asm.flush(), None);
    }

    // ── debounce ───────────────────────────────────────────────────

    #[test]
    fn debouncer_fires_after_quiet_period() {
        let start = Instant::now();
        let mut deb = InputDebouncer::new(DEBOUNCE);
        deb.push("my bill ", start);
        deb.push("is wrong", start + Duration::from_millis(100));

        // Still inside the window measured from the last chunk.
        assert_eq!(deb.take_due(start + Duration::from_millis(400)), None);
        assert_eq!(
            deb.take_due(start + Duration::from_millis(501)).as_deref(),
            Some("my bill is wrong")
        );
        // Consumed.
        assert_eq!(deb.take_due(start + Duration::from_secs(5)), None);
    }

    #[test]
    fn debouncer_take_flushes_early() {
        let start = Instant::now();
        let mut deb = InputDebouncer::new(DEBOUNCE);
        deb.push("quick flush", start);
        assert_eq!(deb.take().as_deref(), Some("quick flush"));
    }

    #[test]
    fn debouncer_whitespace_only_yields_nothing() {
        let start = Instant::now();
        let mut deb = InputDebouncer::new(DEBOUNCE);
        deb.push("   ", start);
        assert_eq!(deb.deadline(), None);
        assert_eq!(deb.take(), None);
    }

    // ── script filter ──────────────────────────────────────────────

    #[test]
    fn script_filter_accepts_plain_english() {
        assert!(passes_script_filter("I want to cancel my subscription"));
    }

    #[test]
    fn script_filter_rejects_devanagari() {
        assert!(!passes_script_filter("नमस्ते, मुझे मदद चाहिए"));
        // Even one stray Indic character poisons the candidate.
        assert!(!passes_script_filter("hello there नम"));
    }

    #[test]
    fn script_filter_rejects_other_indic_blocks() {
        assert!(!passes_script_filter("ಕನ್ನಡ")); // Kannada
        assert!(!passes_script_filter("বাংলা")); // Bengali
        assert!(!passes_script_filter("తెలుగు")); // Telugu
    }

    #[test]
    fn script_filter_rejects_low_ascii_ratio() {
        assert!(!passes_script_filter("1234 5678 90"));
        assert!(!passes_script_filter("!!! ???"));
    }

    #[test]
    fn script_filter_rejects_empty_and_whitespace() {
        assert!(!passes_script_filter(""));
        assert!(!passes_script_filter("   \t "));
    }

    #[test]
    fn script_filter_ratio_boundary() {
        // 3 letters, 10 non-whitespace → exactly 0.30, accepted.
        assert!(passes_script_filter("abc 1234567"));
        // 2 letters, 10 non-whitespace → 0.20, rejected.
        assert!(!passes_script_filter("ab 12345678"));
    }

    // ── echo filter ────────────────────────────────────────────────

    #[test]
    fn echo_normalization_drops_case_and_punctuation() {
        assert_eq!(
            normalize_for_echo("Please hold, while I check!"),
            "please hold while i check"
        );
    }

    #[test]
    fn echo_ring_suppresses_bidirectionally() {
        let now = Instant::now();
        let mut ring = EchoRing::new(ECHO_WINDOW);
        ring.record("Please hold while I check.", now);

        // Exact echo.
        assert!(ring.suppresses("please hold while i check", now + Duration::from_secs(2)));
        // Candidate contains the AI sentence.
        assert!(ring.suppresses(
            "uh please hold while i check okay",
            now + Duration::from_secs(2)
        ));
        // AI sentence contains the candidate.
        assert!(ring.suppresses("hold while i check", now + Duration::from_secs(2)));
        // Unrelated speech passes.
        assert!(!ring.suppresses("my order never arrived", now + Duration::from_secs(2)));
    }

    #[test]
    fn echo_ring_expires_old_sentences() {
        let now = Instant::now();
        let mut ring = EchoRing::new(ECHO_WINDOW);
        ring.record("Please hold while I check.", now);

        let later = now + ECHO_WINDOW + Duration::from_secs(1);
        assert!(!ring.suppresses("please hold while i check", later));
        assert!(ring.is_empty());
    }

    // ── combined pipeline ──────────────────────────────────────────

    #[test]
    fn pipeline_finalizes_ai_sentence_and_suppresses_its_echo() {
        let now = Instant::now();
        let mut p = pipeline();

        let sentences = p.push_output_chunk("Please hold while I check. ", now);
        assert_eq!(sentences, vec!["Please hold while I check."]);

        // Two seconds later the caller's mic picks the same words up.
        let t2 = now + Duration::from_secs(2);
        p.push_input_chunk("please hold while i check", t2);
        let finalized = p.finalize_due_input(t2 + DEBOUNCE + Duration::from_millis(1));
        assert_eq!(
            finalized,
            Some(FinalizedInput::Rejected {
                text: "please hold while i check".into(),
                reason: InputRejection::Echo,
            })
        );
    }

    #[test]
    fn pipeline_rejects_indic_input_silently() {
        let now = Instant::now();
        let mut p = pipeline();
        p.push_input_chunk("नमस्ते, मुझे मदद चाहिए", now);
        let finalized = p.finalize_due_input(now + DEBOUNCE + Duration::from_millis(1));
        assert!(matches!(
            finalized,
            Some(FinalizedInput::Rejected {
                reason: InputRejection::Script,
                ..
            })
        ));
    }

    #[test]
    fn pipeline_turn_complete_flushes_before_debounce() {
        let now = Instant::now();
        let mut p = pipeline();
        p.push_output_chunk("And that resolves", now);
        p.push_input_chunk("thanks so much", now);

        // turnComplete arrives well inside the debounce window.
        let (sentences, input) = p.flush_turn(now + Duration::from_millis(50));
        assert_eq!(sentences, vec!["And that resolves"]);
        assert_eq!(input, Some(FinalizedInput::Accepted("thanks so much".into())));
    }

    #[test]
    fn pipeline_ai_sentence_outside_echo_window_does_not_suppress() {
        let now = Instant::now();
        let mut p = pipeline();
        p.push_output_chunk("Your balance is forty dollars. ", now);

        let late = now + ECHO_WINDOW + Duration::from_secs(5);
        p.push_input_chunk("your balance is forty dollars", late);
        let finalized = p.finalize_due_input(late + DEBOUNCE + Duration::from_millis(1));
        assert_eq!(
            finalized,
            Some(FinalizedInput::Accepted(
                "your balance is forty dollars".into()
            ))
        );
    }

    #[test]
    fn pipeline_clear_output_discards_interrupted_sentence() {
        let now = Instant::now();
        let mut p = pipeline();
        p.push_output_chunk("I was about to say", now);
        p.clear_output();
        let (sentences, _) = p.flush_turn(now);
        assert!(sentences.is_empty());
    }

    #[test]
    fn pipeline_meta_only_sentence_vanishes() {
        let now = Instant::now();
        let mut p = pipeline();
        let sentences = p.push_output_chunk("*typing sounds* ", now);
        assert!(sentences.is_empty());
        let (flushed, _) = p.flush_turn(now);
        assert!(flushed.is_empty());
    }
}
