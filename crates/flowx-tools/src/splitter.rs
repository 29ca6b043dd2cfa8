//! Text splitting strategies for doc nodes.
//!
//! All strategies share the same merge step: pieces are packed greedily into
//! chunks of at most `chunk_size` characters, and each new chunk starts with up
//! to `chunk_overlap` characters carried over from the previous one.

use flowx_dag::{SplitterConfig, SplitterKind};
use flowx_types::{Chunk, FlowError, Result};
use serde_json::json;
use tiktoken_rs::CoreBPE;

/// A strategy that cuts text into pieces.
pub trait TextSplitter: Send + Sync {
    fn split_text(&self, text: &str) -> Vec<String>;

    /// Split `text` into chunks tagged with `mark`.
    fn create_chunks(&self, text: &str, mark: &str) -> Vec<Chunk> {
        self.split_text(text)
            .into_iter()
            .enumerate()
            .map(|(index, content)| {
                let mut chunk = Chunk::new(content, mark);
                chunk.metadata.insert("index".into(), json!(index));
                chunk
            })
            .collect()
    }
}

/// Build the splitter described by `config`.
pub fn splitter_for(config: &SplitterConfig) -> Result<Box<dyn TextSplitter>> {
    if config.chunk_size == 0 {
        return Err(FlowError::config("splitter `chunk_size` must be positive"));
    }
    if config.chunk_overlap >= config.chunk_size {
        return Err(FlowError::config(format!(
            "splitter `chunk_overlap` ({}) must be smaller than `chunk_size` ({})",
            config.chunk_overlap, config.chunk_size
        )));
    }
    let sizing = Sizing {
        chunk_size: config.chunk_size,
        chunk_overlap: config.chunk_overlap,
    };

    let splitter: Box<dyn TextSplitter> = match config.name {
        SplitterKind::Character => Box::new(CharacterSplitter {
            sizing,
            separator: config.separator.clone().unwrap_or_else(|| "\n\n".into()),
        }),
        SplitterKind::Recursive => Box::new(RecursiveSplitter {
            sizing,
            separators: config
                .separators
                .clone()
                .unwrap_or_else(|| to_owned(DEFAULT_SEPARATORS)),
        }),
        SplitterKind::Token => Box::new(TokenSplitter::new(sizing, config.encoding_name.as_deref())?),
        SplitterKind::Markdown => Box::new(RecursiveSplitter::for_language(sizing, "markdown", config)?),
        SplitterKind::Html => Box::new(RecursiveSplitter::for_language(sizing, "html", config)?),
        SplitterKind::Code => {
            let language = config
                .language
                .as_deref()
                .ok_or_else(|| FlowError::config("splitter `language` not defined."))?;
            Box::new(RecursiveSplitter::for_language(sizing, language, config)?)
        }
    };
    Ok(splitter)
}

#[derive(Debug, Clone, Copy)]
struct Sizing {
    chunk_size: usize,
    chunk_overlap: usize,
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn to_owned(separators: &[&str]) -> Vec<String> {
    separators.iter().map(|s| s.to_string()).collect()
}

impl Sizing {
    /// Greedily pack `splits` into chunks joined by `separator`.
    fn merge(&self, splits: &[String], separator: &str) -> Vec<String> {
        let sep_len = char_len(separator);
        let mut docs = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        let mut total = 0usize;

        for piece in splits {
            let len = char_len(piece);
            let joiner = if current.is_empty() { 0 } else { sep_len };
            if total + len + joiner > self.chunk_size {
                if total > self.chunk_size {
                    tracing::warn!(
                        size = total,
                        limit = self.chunk_size,
                        "created a chunk larger than the configured size"
                    );
                }
                if !current.is_empty() {
                    push_joined(&mut docs, &current, separator);
                    while total > self.chunk_overlap
                        || (total > 0
                            && total + len + if current.is_empty() { 0 } else { sep_len }
                                > self.chunk_size)
                    {
                        let first = current.remove(0);
                        total -= char_len(first) + if current.is_empty() { 0 } else { sep_len };
                    }
                }
            }
            total += len + if current.is_empty() { 0 } else { sep_len };
            current.push(piece);
        }
        push_joined(&mut docs, &current, separator);
        docs
    }
}

fn push_joined(docs: &mut Vec<String>, parts: &[&str], separator: &str) {
    let joined = parts.join(separator);
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        docs.push(trimmed.to_string());
    }
}

/// Split on `separator`, keeping the separator at the start of the next piece.
fn split_keeping(text: &str, separator: &str) -> Vec<String> {
    if separator.is_empty() {
        return text.chars().map(String::from).collect();
    }
    let mut pieces = Vec::new();
    let mut last = 0;
    for (idx, _) in text.match_indices(separator) {
        if idx > last {
            pieces.push(text[last..idx].to_string());
        }
        last = idx;
    }
    pieces.push(text[last..].to_string());
    pieces.retain(|p| !p.is_empty());
    pieces
}

// ---------------------------------------------------------------------------
// CharacterSplitter
// ---------------------------------------------------------------------------

pub struct CharacterSplitter {
    sizing: Sizing,
    separator: String,
}

impl TextSplitter for CharacterSplitter {
    fn split_text(&self, text: &str) -> Vec<String> {
        let splits: Vec<String> = if self.separator.is_empty() {
            text.chars().map(String::from).collect()
        } else {
            text.split(self.separator.as_str())
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        };
        self.sizing.merge(&splits, &self.separator)
    }
}

// ---------------------------------------------------------------------------
// RecursiveSplitter
// ---------------------------------------------------------------------------

const DEFAULT_SEPARATORS: &[&str] = &["\n\n", "\n", " ", ""];

pub struct RecursiveSplitter {
    sizing: Sizing,
    separators: Vec<String>,
}

impl RecursiveSplitter {
    fn for_language(sizing: Sizing, language: &str, config: &SplitterConfig) -> Result<Self> {
        let separators = match &config.separators {
            Some(custom) => custom.clone(),
            None => to_owned(language_separators(language).ok_or_else(|| {
                FlowError::config(format!("unsupported splitter language `{language}`"))
            })?),
        };
        Ok(Self { sizing, separators })
    }

    fn split_with(&self, text: &str, separators: &[String]) -> Vec<String> {
        let mut finals = Vec::new();

        let mut separator = separators.last().cloned().unwrap_or_default();
        let mut rest: &[String] = &[];
        for (i, candidate) in separators.iter().enumerate() {
            if candidate.is_empty() {
                separator = String::new();
                break;
            }
            if text.contains(candidate.as_str()) {
                separator = candidate.clone();
                rest = &separators[i + 1..];
                break;
            }
        }

        let mut good: Vec<String> = Vec::new();
        for piece in split_keeping(text, &separator) {
            if char_len(&piece) < self.sizing.chunk_size {
                good.push(piece);
                continue;
            }
            if !good.is_empty() {
                finals.extend(self.sizing.merge(&good, ""));
                good.clear();
            }
            if rest.is_empty() {
                finals.push(piece);
            } else {
                finals.extend(self.split_with(&piece, rest));
            }
        }
        if !good.is_empty() {
            finals.extend(self.sizing.merge(&good, ""));
        }
        finals
    }
}

impl TextSplitter for RecursiveSplitter {
    fn split_text(&self, text: &str) -> Vec<String> {
        self.split_with(text, &self.separators)
    }
}

/// Separators tried, in order, for a language-aware recursive split.
pub fn language_separators(language: &str) -> Option<&'static [&'static str]> {
    let separators: &'static [&'static str] = match language.to_ascii_lowercase().as_str() {
        "markdown" | "md" => &[
            "\n## ", "\n### ", "\n#### ", "\n##### ", "\n###### ", "```\n\n", "\n\n***\n\n",
            "\n\n---\n\n", "\n\n___\n\n", "\n\n", "\n", " ", "",
        ],
        "html" => &[
            "<body>", "<div>", "<p>", "<br>", "<li>", "<h1>", "<h2>", "<h3>", "<h4>", "<h5>",
            "<h6>", "<span>", "<table>", "<tr>", "<td>", "<th>", "<ul>", "<ol>", "<header>",
            "<footer>", "<nav>", "<head>", "<style>", "<script>", "<meta>", "<title>", " ", "",
        ],
        "rust" => &[
            "\nfn ", "\nconst ", "\nlet ", "\nif ", "\nwhile ", "\nfor ", "\nloop ", "\nmatch ",
            "\n\n", "\n", " ", "",
        ],
        "python" => &["\nclass ", "\ndef ", "\n\tdef ", "\n\n", "\n", " ", ""],
        "js" | "javascript" | "ts" | "typescript" => &[
            "\nfunction ", "\nconst ", "\nlet ", "\nvar ", "\nclass ", "\nif ", "\nfor ",
            "\nwhile ", "\nswitch ", "\ncase ", "\ndefault ", "\n\n", "\n", " ", "",
        ],
        "go" => &[
            "\nfunc ", "\nvar ", "\nconst ", "\ntype ", "\nif ", "\nfor ", "\nswitch ",
            "\ncase ", "\n\n", "\n", " ", "",
        ],
        "java" => &[
            "\nclass ", "\npublic ", "\nprotected ", "\nprivate ", "\nstatic ", "\nif ",
            "\nfor ", "\nwhile ", "\nswitch ", "\ncase ", "\n\n", "\n", " ", "",
        ],
        "cpp" | "c" => &[
            "\nclass ", "\nvoid ", "\nint ", "\nfloat ", "\ndouble ", "\nif ", "\nfor ",
            "\nwhile ", "\nswitch ", "\ncase ", "\n\n", "\n", " ", "",
        ],
        "ruby" => &[
            "\ndef ", "\nclass ", "\nif ", "\nunless ", "\nwhile ", "\nfor ", "\ndo ",
            "\nbegin ", "\nrescue ", "\n\n", "\n", " ", "",
        ],
        "php" => &[
            "\nfunction ", "\nclass ", "\nif ", "\nforeach ", "\nwhile ", "\ndo ", "\nswitch ",
            "\ncase ", "\n\n", "\n", " ", "",
        ],
        "latex" => &[
            "\n\\chapter{", "\n\\section{", "\n\\subsection{", "\n\\subsubsection{",
            "\n\\begin{enumerate}", "\n\\begin{itemize}", "\n\\begin{description}",
            "\n\\begin{list}", "\n\\begin{quote}", "\n\\begin{quotation}", "\n\\begin{verse}",
            "\n\\begin{verbatim}", "\n\\begin{align}", "$$", "$", "\n\n", "\n", " ", "",
        ],
        _ => return None,
    };
    Some(separators)
}

// ---------------------------------------------------------------------------
// TokenSplitter
// ---------------------------------------------------------------------------

/// Splits on BPE tokens of the named encoding; sizes are counted in tokens.
pub struct TokenSplitter {
    sizing: Sizing,
    bpe: CoreBPE,
}

/// Encoding used when a token splitter names none.
pub const DEFAULT_TOKEN_ENCODING: &str = "gpt2";

fn load_encoding(name: &str) -> Result<CoreBPE> {
    let loaded = match name {
        "gpt2" | "r50k_base" => tiktoken_rs::r50k_base(),
        "p50k_base" => tiktoken_rs::p50k_base(),
        "cl100k_base" => tiktoken_rs::cl100k_base(),
        "o200k_base" => tiktoken_rs::o200k_base(),
        other => return Err(FlowError::config(format!("unknown token encoding `{other}`"))),
    };
    loaded.map_err(|e| FlowError::Other(format!("token encoding `{name}` failed to load: {e}")))
}

impl TokenSplitter {
    fn new(sizing: Sizing, encoding: Option<&str>) -> Result<Self> {
        let bpe = load_encoding(encoding.unwrap_or(DEFAULT_TOKEN_ENCODING))?;
        Ok(Self { sizing, bpe })
    }
}

impl TextSplitter for TokenSplitter {
    fn split_text(&self, text: &str) -> Vec<String> {
        let tokens = self.bpe.encode_ordinary(text);
        // Nudge either window edge past a split multi-byte character; one
        // character spans at most four tokens.
        let decode_window = |start: usize, end: usize| -> Option<String> {
            for s in start..(start + 4).min(end) {
                for e in end..=(end + 3).min(tokens.len()) {
                    if let Ok(text) = self.bpe.decode(tokens[s..e].to_vec()) {
                        return Some(text);
                    }
                }
            }
            None
        };
        let mut chunks = Vec::new();
        let step = self.sizing.chunk_size - self.sizing.chunk_overlap;
        let mut start = 0;
        while start < tokens.len() {
            let end = (start + self.sizing.chunk_size).min(tokens.len());
            if let Some(piece) = decode_window(start, end) {
                let piece = piece.trim();
                if !piece.is_empty() {
                    chunks.push(piece.to_string());
                }
            }
            if end == tokens.len() {
                break;
            }
            start += step;
        }
        chunks
    }
}
