use nom::character::complete::{digit1, satisfy};
use nom::combinator::{all_consuming, map_res, recognize};
use nom::error::{VerboseError, convert_error};
use nom::multi::many0_count;
use nom::sequence::pair;
use nom::IResult;

pub type NomResult<'a, Ret> = IResult<&'a str, Ret, VerboseError<&'a str>>;

/// Runs `parser` and fails unless it consumes the whole input.
pub fn consume_all<'a, O, F>(parser: F, input: &'a str) -> anyhow::Result<O>
where
    F: FnMut(&'a str) -> NomResult<'a, O>,
{
    match all_consuming(parser)(input) {
        Ok((_, value)) => Ok(value),
        Err(nom::Err::Error(error) | nom::Err::Failure(error)) => {
            Err(anyhow::anyhow!("Cannot parse `{input}`\n{}", convert_error(input, error)))
        }
        Err(nom::Err::Incomplete(_)) => Err(anyhow::anyhow!("Unexpected end of `{input}`")),
    }
}

/// Digits, optionally separated by underscores (`1_000`).
fn p_integer(input: &str) -> NomResult<String> {
    let (rest, number) = recognize(pair(digit1, many0_count(satisfy(|c| c == '_' || c.is_ascii_digit()))))(input)?;
    Ok((rest, number.replace('_', "")))
}

pub fn p_u32(input: &str) -> NomResult<u32> {
    map_res(p_integer, |number| number.parse::<u32>())(input)
}

pub fn p_u64(input: &str) -> NomResult<u64> {
    map_res(p_integer, |number| number.parse::<u64>())(input)
}

#[cfg(test)]
mod tests {
    use super::{consume_all, p_u32, p_u64};

    #[test]
    fn parse_integers() {
        assert_eq!(consume_all(p_u32, "0").unwrap(), 0);
        assert_eq!(consume_all(p_u32, "1019").unwrap(), 1019);
        assert_eq!(consume_all(p_u32, "1_000").unwrap(), 1000);
        assert_eq!(consume_all(p_u64, "10_240_000_000").unwrap(), 10_240_000_000);
    }

    #[test]
    fn reject_invalid_integers() {
        assert!(consume_all(p_u32, "").is_err());
        assert!(consume_all(p_u32, "x").is_err());
        assert!(consume_all(p_u32, "_1").is_err());
        assert!(consume_all(p_u32, "99999999999").is_err());
    }

    #[test]
    fn reject_trailing_input() {
        let error = consume_all(p_u64, "12kb").unwrap_err();
        assert!(error.to_string().starts_with("Cannot parse `12kb`"));
    }
}
