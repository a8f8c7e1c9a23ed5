//! EPD test-suite parsing.
//!
//! One position per line: four FEN fields (no move counters), then
//! semicolon-terminated opcode entries. Recognised opcodes: `bm` (best
//! moves, SAN), `am` (moves to avoid, SAN), `id "…"`, `pts { san points … }`
//! for per-move scoring, and `c0`–`c9` comments (ignored).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EpdError {
    #[error("line {line}: incomplete FEN '{text}'")]
    IncompleteFen { line: usize, text: String },

    #[error("line {line}: position needs a 'bm' or 'am' opcode")]
    MissingJudgement { line: usize },

    #[error("line {line}: malformed '{opcode}' entry: {reason}")]
    MalformedOpcode {
        line: usize,
        opcode: String,
        reason: String,
    },
}

/// One strength-test position with its judging data.
#[derive(Debug, Clone)]
pub struct StrengthTestSpec {
    pub fen: String,
    pub id: Option<String>,
    /// Best/alternative moves with their point values (1 unless `pts` says
    /// otherwise).
    pub best_sans: Vec<(String, i32)>,
    /// Playing any of these scores zero.
    pub avoid_sans: Vec<String>,
}

impl StrengthTestSpec {
    /// The best achievable score for this position.
    pub fn achievable(&self) -> i32 {
        self.best_sans
            .iter()
            .map(|&(_, points)| points)
            .max()
            .unwrap_or(1)
    }
}

/// Parse a whole EPD file. Blank lines are skipped.
pub fn parse_epd(text: &str) -> Result<Vec<StrengthTestSpec>, EpdError> {
    let mut specs = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line_number = index + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        specs.push(parse_line(trimmed, line_number)?);
    }
    Ok(specs)
}

fn parse_line(line: &str, line_number: usize) -> Result<StrengthTestSpec, EpdError> {
    let mut fields = line.splitn(5, char::is_whitespace);
    let fen_fields: Vec<&str> = (0..4).filter_map(|_| fields.next()).collect();
    if fen_fields.len() < 4 {
        return Err(EpdError::IncompleteFen {
            line: line_number,
            text: line.to_string(),
        });
    }
    // EPD omits the halfmove/fullmove counters.
    let fen = format!("{} 0 1", fen_fields.join(" "));
    let rest = fields.next().unwrap_or("");

    let mut best_sans: Vec<String> = Vec::new();
    let mut avoid_sans: Vec<String> = Vec::new();
    let mut points: Vec<(String, i32)> = Vec::new();
    let mut id = None;

    for entry in rest.split(';') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (opcode, args) = match entry.split_once(char::is_whitespace) {
            Some((opcode, args)) => (opcode, args.trim()),
            None => (entry, ""),
        };

        match opcode {
            "bm" => best_sans.extend(args.split_whitespace().map(str::to_string)),
            "am" => avoid_sans.extend(args.split_whitespace().map(str::to_string)),
            "id" => id = Some(args.trim_matches('"').to_string()),
            "pts" => points = parse_points(args, line_number)?,
            // Comments and any unrecognised opcodes are ignored.
            _ => {}
        }
    }

    if best_sans.is_empty() && avoid_sans.is_empty() {
        return Err(EpdError::MissingJudgement { line: line_number });
    }

    // Point values attach to their bm entries; moves only named in `pts`
    // also count as scored alternatives.
    let mut best_with_points: Vec<(String, i32)> = best_sans
        .into_iter()
        .map(|san| {
            let score = points
                .iter()
                .find(|(name, _)| *name == san)
                .map(|&(_, score)| score)
                .unwrap_or(1);
            (san, score)
        })
        .collect();
    for (san, score) in points {
        if !best_with_points.iter().any(|(name, _)| *name == san) {
            best_with_points.push((san, score));
        }
    }

    Ok(StrengthTestSpec {
        fen,
        id,
        best_sans: best_with_points,
        avoid_sans,
    })
}

/// `pts { Qg6 10, Bxg6 3 }` — pairs of SAN and integer, comma or space
/// separated, inside braces.
fn parse_points(args: &str, line_number: usize) -> Result<Vec<(String, i32)>, EpdError> {
    let malformed = |reason: &str| EpdError::MalformedOpcode {
        line: line_number,
        opcode: "pts".to_string(),
        reason: reason.to_string(),
    };

    let inner = args
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
        .ok_or_else(|| malformed("expected braces"))?;

    let tokens: Vec<&str> = inner
        .split(|c: char| c.is_whitespace() || c == ',' || c == '=')
        .filter(|token| !token.is_empty())
        .collect();
    if tokens.is_empty() || tokens.len() % 2 != 0 {
        return Err(malformed("expected san/points pairs"));
    }

    let mut points = Vec::new();
    for pair in tokens.chunks(2) {
        let score: i32 = pair[1]
            .parse()
            .map_err(|_| malformed(&format!("'{}' is not an integer", pair[1])))?;
        points.push((pair[0].to_string(), score));
    }
    Ok(points)
}
