use crate::mdl::lex::constants::{named_constant, MAX_NAME};

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum NumberError {
    /// Structurally broken literal; `consumed` bytes belong to it.
    Malformed { consumed: usize },
    /// A trailing `_…` token that names no known constant.
    UnknownConstant { consumed: usize },
}

impl NumberError {
    pub(crate) fn consumed(&self) -> usize {
        match self {
            NumberError::Malformed { consumed } => *consumed,
            NumberError::UnknownConstant { consumed } => *consumed,
        }
    }
}

/// Scan an engineering-number literal at the start of `input`.
///
/// Grammar: optional sign, digits, optional `.` with digits, optional `e`
/// with a signed integer exponent, optional SI suffix letter, optional
/// trailing named constant. A literal may also consist of a named constant
/// alone. Returns the folded value and the number of bytes consumed.
pub(crate) fn scan_number(input: &[u8]) -> Result<(f64, usize), NumberError> {
    let mut i = 0;
    let mut sign = 1.0;
    if let Some(b'+' | b'-') = input.first() {
        if input[0] == b'-' {
            sign = -1.0;
        }
        i = 1;
    }

    let mut n_dig = 0;
    while input.get(i).is_some_and(u8::is_ascii_digit) {
        i += 1;
        n_dig += 1;
    }
    // a literal starts with a digit or goes straight to a named constant
    if n_dig == 0 && input.get(i) != Some(&b'_') {
        return Err(NumberError::Malformed { consumed: i });
    }

    if input.get(i) == Some(&b'.') {
        i += 1;
        let mut frac_dig = 0;
        while input.get(i).is_some_and(u8::is_ascii_digit) {
            i += 1;
            frac_dig += 1;
        }
        if frac_dig == 0 {
            return Err(NumberError::Malformed { consumed: i });
        }
    }

    if n_dig > 0 && input.get(i) == Some(&b'e') {
        i += 1;
        if let Some(b'+' | b'-') = input.get(i) {
            i += 1;
        }
        let mut exp_dig = 0;
        while input.get(i).is_some_and(u8::is_ascii_digit) {
            i += 1;
            exp_dig += 1;
        }
        if exp_dig == 0 {
            return Err(NumberError::Malformed { consumed: i });
        }
    }
    let numeric_end = i;

    let factor = match input.get(i).copied().and_then(suffix_factor) {
        Some(factor) => {
            i += 1;
            factor
        }
        None => 1.0,
    };

    let mut number = 1.0;
    if n_dig > 0 {
        let text = std::str::from_utf8(&input[..numeric_end])
            .map_err(|_| NumberError::Malformed { consumed: numeric_end })?;
        number = text
            .parse::<f64>()
            .map_err(|_| NumberError::Malformed { consumed: numeric_end })?;
        number *= factor;
        sign = 1.0;
    }

    if input.get(i) == Some(&b'_') {
        let mut j = i + 1;
        while input
            .get(j)
            .is_some_and(|ch| ch.is_ascii_alphanumeric() || *ch == b'_')
        {
            j += 1;
        }
        if j - i > MAX_NAME {
            return Err(NumberError::Malformed { consumed: j });
        }
        let name = std::str::from_utf8(&input[i..j])
            .map_err(|_| NumberError::Malformed { consumed: j })?;
        let Some(constant) = named_constant(name) else {
            return Err(NumberError::UnknownConstant { consumed: j });
        };
        return Ok((sign * number * constant, j));
    }

    Ok((number, i))
}

pub(crate) fn suffix_factor(ch: u8) -> Option<f64> {
    Some(match ch {
        b'y' => 1e-24,
        b'z' => 1e-21,
        b'a' | b'A' => 1e-18,
        b'f' | b'F' => 1e-15,
        b'p' => 1e-12,
        b'n' | b'N' => 1e-9,
        b'u' | b'U' => 1e-6,
        b'm' => 1e-3,
        b'k' | b'K' => 1e3,
        b'M' => 1e6,
        b'G' => 1e9,
        b'T' => 1e12,
        b'P' => 1e15,
        b'E' => 1e18,
        b'Z' => 1e21,
        b'Y' => 1e24,
        _ => return None,
    })
}

/// Render `value` in engineering notation with `digits` significant digits,
/// using the SI suffix letters where the exponent allows it and plain
/// scientific notation otherwise. The output is always a legal literal.
pub fn format_eng(value: f64, digits: usize) -> String {
    if !value.is_finite() {
        return format!("{value}");
    }
    let prec = digits.saturating_sub(1);
    let sci = format!("{value:.prec$e}");
    let (mantissa, exp) = sci.split_once('e').expect("scientific format has exponent");
    let iexp: i32 = exp.parse().expect("numeric exponent");
    if !(-24..=26).contains(&iexp) {
        return sci;
    }
    let ibase = (iexp + 24).div_euclid(3) * 3 - 24;
    let shift = (iexp - ibase) as usize;
    let (sign, mantissa) = match mantissa.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", mantissa),
    };
    let mut all_digits: String = mantissa.chars().filter(|ch| *ch != '.').collect();
    let dot = 1 + shift;
    while all_digits.len() < dot {
        all_digits.push('0');
    }
    let mut out = String::from(sign);
    out.push_str(&all_digits[..dot]);
    if all_digits.len() > dot {
        out.push('.');
        out.push_str(&all_digits[dot..]);
    }
    out.push_str(eng_suffix(ibase));
    out
}

fn eng_suffix(ibase: i32) -> &'static str {
    match ibase {
        -24 => "y",
        -21 => "z",
        -18 => "a",
        -15 => "f",
        -12 => "p",
        -9 => "n",
        -6 => "u",
        -3 => "m",
        3 => "k",
        6 => "M",
        9 => "G",
        12 => "T",
        15 => "P",
        18 => "E",
        21 => "Z",
        24 => "Y",
        _ => "",
    }
}
