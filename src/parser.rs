use nom::{
    branch::alt,
    bytes::complete::{tag_no_case, take_until, take_while1},
    character::complete::{char, multispace0, multispace1},
    combinator::{map, opt},
    sequence::{delimited, preceded},
    IResult,
};

#[derive(Debug, PartialEq, Clone)]
pub enum Command {
    Put { url: String, hash: String, title: String, creator: Option<String>, transcript: Option<String> },
    Get { url: String },
    Like { url: String, voter: String },
    Dislike { url: String, voter: String },
    Sync { hash: String },
    Doc { hash: String },
    Search { term: String },
    Ping,
    Version,
    Help,
    Exit,
}

// --- BASIC PARSERS ---

fn parse_quoted_string(input: &str) -> IResult<&str, String> {
    let (input, _) = char('"')(input)?;
    let (input, content) = take_until("\"")(input)?;
    let (input, _) = char('"')(input)?;
    Ok((input, content.to_string()))
}

/// `'abc'` or a bare `abc` (anything up to whitespace or a quote).
fn parse_ident(input: &str) -> IResult<&str, String> {
    alt((
        map(delimited(char('\''), take_while1(|c: char| c != '\''), char('\'')), String::from),
        map(take_while1(|c: char| !c.is_whitespace() && c != '\'' && c != '"'), String::from),
    ))(input)
}

// --- HELPERS ---
fn ws<'a, F, O, E: nom::error::ParseError<&'a str>>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O, E>
where
    F: FnMut(&'a str) -> IResult<&'a str, O, E>,
{
    delimited(multispace0, inner, multispace0)
}

fn tag_ci(t: &'static str) -> impl FnMut(&str) -> IResult<&str, &str> {
    move |input| tag_no_case(t)(input)
}

/// `KEYWORD <ident>` with at least one space between.
fn keyword_ident(kw: &'static str) -> impl FnMut(&str) -> IResult<&str, String> {
    move |input| {
        let (input, _) = tag_ci(kw)(input)?;
        let (input, _) = multispace1(input)?;
        parse_ident(input)
    }
}

// --- COMMAND PARSERS ---

// PUT 'url' HASH 'h1' TITLE "Some title" [CREATOR "name"] [TRANSCRIPT "hello world"]
fn parse_put(input: &str) -> IResult<&str, Command> {
    let (input, url) = keyword_ident("PUT")(input)?;
    let (input, _) = ws(tag_ci("HASH"))(input)?;
    let (input, hash) = parse_ident(input)?;
    let (input, _) = ws(tag_ci("TITLE"))(input)?;
    let (input, title) = parse_quoted_string(input)?;
    let (input, creator) = opt(preceded(ws(tag_ci("CREATOR")), parse_quoted_string))(input)?;
    let (input, transcript) = opt(preceded(ws(tag_ci("TRANSCRIPT")), parse_quoted_string))(input)?;
    Ok((input, Command::Put { url, hash, title, creator, transcript }))
}

fn parse_get(input: &str) -> IResult<&str, Command> {
    map(keyword_ident("GET"), |url| Command::Get { url })(input)
}

// LIKE 'url' BY 'voter'
fn parse_vote(input: &str) -> IResult<&str, Command> {
    let (input, like) = alt((map(tag_ci("DISLIKE"), |_| false), map(tag_ci("LIKE"), |_| true)))(input)?;
    let (input, _) = multispace1(input)?;
    let (input, url) = parse_ident(input)?;
    let (input, _) = ws(tag_ci("BY"))(input)?;
    let (input, voter) = parse_ident(input)?;
    let cmd = if like { Command::Like { url, voter } } else { Command::Dislike { url, voter } };
    Ok((input, cmd))
}

fn parse_sync(input: &str) -> IResult<&str, Command> {
    map(alt((keyword_ident("SYNC"), keyword_ident("INDEX"))), |hash| Command::Sync { hash })(input)
}

fn parse_doc(input: &str) -> IResult<&str, Command> {
    map(keyword_ident("DOC"), |hash| Command::Doc { hash })(input)
}

fn parse_search(input: &str) -> IResult<&str, Command> {
    map(alt((keyword_ident("SEARCH"), keyword_ident("FIND"))), |term| Command::Search { term })(input)
}

fn parse_simple(input: &str) -> IResult<&str, Command> {
    alt((
        map(tag_ci("PING"), |_| Command::Ping),
        map(tag_ci("VERSION"), |_| Command::Version),
        map(tag_ci("HELP"), |_| Command::Help),
        map(alt((tag_ci("EXIT"), tag_ci("QUIT"))), |_| Command::Exit),
    ))(input)
}

pub fn parse_command(input: &str) -> Result<Command, String> {
    let input = input.trim();
    let result = alt((parse_put, parse_get, parse_vote, parse_sync, parse_doc, parse_search, parse_simple))(input);

    match result {
        Ok((remainder, cmd)) => {
            if !remainder.trim().is_empty() {
                return Err(format!("Unexpected tokens at end: '{}'", remainder));
            }
            Ok(cmd)
        }
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            let context: String = e.input.chars().take(20).collect();
            if context.len() < e.input.len() {
                Err(format!("Invalid syntax near: '{}...'", context))
            } else {
                Err(format!("Invalid syntax near: '{}'", context))
            }
        }
        Err(nom::Err::Incomplete(_)) => Err("Incomplete command.".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_with_optional_parts() {
        assert_eq!(
            parse_command("put 'abc' HASH h1 TITLE \"My clip\"").unwrap(),
            Command::Put { url: "abc".into(), hash: "h1".into(), title: "My clip".into(), creator: None, transcript: None }
        );
        assert_eq!(
            parse_command("PUT abc HASH 'h1' TITLE \"t\" CREATOR \"carol\" TRANSCRIPT \"hello world\"").unwrap(),
            Command::Put {
                url: "abc".into(),
                hash: "h1".into(),
                title: "t".into(),
                creator: Some("carol".into()),
                transcript: Some("hello world".into()),
            }
        );
    }

    #[test]
    fn single_argument_commands() {
        assert_eq!(parse_command("GET 'abc'").unwrap(), Command::Get { url: "abc".into() });
        assert_eq!(parse_command("sync h1").unwrap(), Command::Sync { hash: "h1".into() });
        assert_eq!(parse_command("INDEX h1").unwrap(), Command::Sync { hash: "h1".into() });
        assert_eq!(parse_command("DOC h1").unwrap(), Command::Doc { hash: "h1".into() });
        assert_eq!(parse_command("  SEARCH hello  ").unwrap(), Command::Search { term: "hello".into() });
        assert_eq!(parse_command("find hello").unwrap(), Command::Search { term: "hello".into() });
    }

    #[test]
    fn votes() {
        assert_eq!(
            parse_command("LIKE abc BY alice").unwrap(),
            Command::Like { url: "abc".into(), voter: "alice".into() }
        );
        assert_eq!(
            parse_command("dislike 'abc' by 'bob'").unwrap(),
            Command::Dislike { url: "abc".into(), voter: "bob".into() }
        );
    }

    #[test]
    fn bare_words() {
        assert_eq!(parse_command("ping").unwrap(), Command::Ping);
        assert_eq!(parse_command("VERSION").unwrap(), Command::Version);
        assert_eq!(parse_command("help").unwrap(), Command::Help);
        assert_eq!(parse_command("quit").unwrap(), Command::Exit);
    }

    #[test]
    fn errors_point_at_the_problem() {
        assert!(parse_command("SEARCH hello world").unwrap_err().starts_with("Unexpected tokens"));
        assert!(parse_command("PUT abc TITLE \"x\"").is_err());
        assert!(parse_command("DROP TABLE videos").unwrap_err().starts_with("Invalid syntax"));
        assert!(parse_command("GET").is_err());
    }
}
