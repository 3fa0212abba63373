use std::io::{self, Write};

use clap::Parser;
use reqwest::{Client, Response};
use serde_json::Value;
use vidsearch::api::VideoForm;
use vidsearch::codec;
use vidsearch::model::{Transcript, Video, Word};
use vidsearch::parser::{self, Command};

/// Seconds given to each word of a transcript typed at the prompt.
const WORD_SECONDS: f64 = 0.5;

#[derive(Parser, Clone, Debug)]
#[clap(author, version, about = "Interactive client for the vidsearch HTTP API", long_about = None)]
struct Args {
    /// Base url of the vidsearch API
    #[clap(long, default_value = "http://127.0.0.1:3001")]
    api: String,
}

struct Session {
    http: Client,
    base: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();
    let session = Session { http: Client::new(), base: args.api.trim_end_matches('/').to_string() };
    print_banner();

    match session.http.get(session.url("/api/isalive")).send().await {
        Ok(resp) if resp.status().is_success() => println!("[\u{2713}] Connected to vidsearch at {}!", session.base),
        _ => {
            println!("[\u{2717}] Could not reach the API at {}.", session.base);
            println!("    Make sure 'vidstore' and 'vidsearch' are running.");
            return;
        }
    }
    println!("Type 'HELP' for supported commands or 'EXIT' to quit.\n");

    let stdin = io::stdin();
    let mut buffer = String::new();

    loop {
        print!("vidsearch> ");
        if io::stdout().flush().is_err() {
            break;
        }
        buffer.clear();

        match stdin.read_line(&mut buffer) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        if buffer.trim().is_empty() {
            continue;
        }

        match parser::parse_command(&buffer) {
            Ok(Command::Exit) => break,
            Ok(cmd) => {
                if let Err(e) = session.execute(cmd).await {
                    println!("[\u{26a0}\u{fe0f} Error] {}", e);
                }
            }
            Err(e) => {
                println!("[\u{2717} Syntax Error] {}", e);
                if buffer.to_uppercase().starts_with("PUT") {
                    println!("    \u{2139}\u{fe0f}  Hint: PUT 'url' HASH 'hash' TITLE \"title\" [TRANSCRIPT \"words ...\"]");
                } else if buffer.trim().contains(char::is_whitespace) && buffer.to_uppercase().starts_with("SEARCH") {
                    println!("    \u{2139}\u{fe0f}  Hint: searches match a single transcript word");
                }
            }
        }
    }
    println!("Bye.");
}

fn print_banner() {
    println!("\n==================================================");
    println!("   vidsearch CLI - transcripts, stored and found");
    println!("==================================================\n");
}

fn print_help() {
    println!("\n--- Available Commands ---");
    println!("1. PUT:     PUT 'url' HASH 'hash' TITLE \"title\" [CREATOR \"name\"] [TRANSCRIPT \"hello world\"]");
    println!("2. GET:     GET 'url'");
    println!("3. LIKE:    LIKE 'url' BY 'voter'   (DISLIKE works the same)");
    println!("4. SYNC:    SYNC 'hash'             (push the stored record into the index)");
    println!("5. DOC:     DOC 'hash'              (show the indexed document)");
    println!("6. SEARCH:  SEARCH word");
    println!("7. PING / VERSION");
    println!("8. EXIT:    Quit\n");
}

/// Words typed at the prompt, spaced `WORD_SECONDS` apart.
fn typed_transcript(text: &str) -> Transcript {
    Transcript::new(
        text.split_whitespace()
            .enumerate()
            .map(|(i, token)| {
                let begin = i as f64 * WORD_SECONDS;
                Word::new(token, begin, begin + WORD_SECONDS, 1.0)
            })
            .collect(),
    )
}

impl Session {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn execute(&self, cmd: Command) -> Result<(), String> {
        match cmd {
            Command::Help => {
                print_help();
                Ok(())
            }
            Command::Put { url, hash, title, creator, transcript } => {
                let mut video = Video::new(url, hash, title);
                video.creator = creator.unwrap_or_default();
                if let Some(text) = transcript {
                    video.transcript = typed_transcript(&text);
                }
                self.store(&video).await?;
                println!("[\u{2713} OK] Stored {} (hash {})", video.url, video.hash);
                Ok(())
            }
            Command::Get { url } => {
                let video = self.fetch(&url).await?;
                print_video(&video);
                Ok(())
            }
            Command::Like { url, voter } => self.vote(&url, voter, true).await,
            Command::Dislike { url, voter } => self.vote(&url, voter, false).await,
            Command::Sync { hash } => {
                let path = format!("/api/index/{}", urlencoding::encode(&hash));
                self.send(self.http.post(self.url(&path))).await?;
                println!("[\u{2713} OK] Indexed {}", hash);
                Ok(())
            }
            Command::Doc { hash } => {
                let path = format!("/api/index/{}", urlencoding::encode(&hash));
                let doc: Value = self.json(self.http.get(self.url(&path))).await?;
                println!("{}", serde_json::to_string_pretty(&doc).unwrap_or_else(|_| doc.to_string()));
                Ok(())
            }
            Command::Search { term } => {
                let req = self.http.get(self.url("/api/search")).query(&[("q", term.as_str())]);
                let body: Value = self.json(req).await?;
                let ids = body["ids"].as_array().cloned().unwrap_or_default();
                println!("\nFound {} matches:", ids.len());
                for id in ids {
                    println!("  \u{2022} {}", id.as_str().unwrap_or_default());
                }
                println!();
                Ok(())
            }
            Command::Ping => {
                let resp = self.send(self.http.get(self.url("/api/isalive"))).await?;
                println!("{}", resp.text().await.map_err(|e| e.to_string())?);
                Ok(())
            }
            Command::Version => {
                let body: Value = self.json(self.http.get(self.url("/api/version"))).await?;
                println!("Index service version: {}", body["version"].as_str().unwrap_or("?"));
                Ok(())
            }
            Command::Exit => Ok(()),
        }
    }

    async fn vote(&self, url: &str, voter: String, like: bool) -> Result<(), String> {
        let mut video = self.fetch(url).await?;
        if like {
            video.like(voter.clone());
        } else {
            video.dislike(voter.clone());
        }
        self.store(&video).await?;
        println!(
            "[\u{2713} OK] {} {} {} ({} likes, {} dislikes)",
            voter,
            if like { "likes" } else { "dislikes" },
            url,
            video.likes.len(),
            video.dislikes.len()
        );
        Ok(())
    }

    async fn store(&self, video: &Video) -> Result<(), String> {
        self.send(self.http.post(self.url("/api/videos")).form(&VideoForm::from(video)))
            .await
            .map(|_| ())
    }

    async fn fetch(&self, url: &str) -> Result<Video, String> {
        let path = format!("/api/videos/{}", urlencoding::encode(url));
        let resp = self.send(self.http.get(self.url(&path))).await?;
        let bytes = resp.bytes().await.map_err(|e| e.to_string())?;
        codec::decode(&bytes).map_err(|e| e.to_string())
    }

    async fn json(&self, req: reqwest::RequestBuilder) -> Result<Value, String> {
        let resp = self.send(req).await?;
        resp.json().await.map_err(|e| e.to_string())
    }

    /// Sends and turns error statuses into the server's message.
    async fn send(&self, req: reqwest::RequestBuilder) -> Result<Response, String> {
        let resp = req.send().await.map_err(|e| e.to_string())?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        match (body["error"].as_str(), body["message"].as_str()) {
            (Some(kind), Some(message)) => Err(format!("{} ({}): {}", kind, status, message)),
            _ => Err(format!("Server answered {}", status)),
        }
    }
}

fn print_video(v: &Video) {
    println!("\n{} [{}]", v.title, v.url);
    println!("  hash:      {}", v.hash);
    println!("  creator:   {}", v.creator);
    println!("  stored:    {}", v.timestamp.to_rfc3339());
    println!("  private:   {}", v.private);
    println!("  views:     {}", v.views);
    println!("  likes:     {}  dislikes: {}", v.likes.len(), v.dislikes.len());
    if v.transcript.is_empty() {
        println!("  transcript: (none)\n");
    } else {
        println!("  transcript: {}\n", v.transcript.text());
    }
}
