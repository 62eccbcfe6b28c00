use std::io::Write;

use clap::Parser;
use futures::StreamExt;
use serde_json::Value;

use medrelay_server::models::{ChatRequest, Usage};

use crate::client::{FrameStream, RelayClient, StreamFrame};
use crate::error::{CliError, CliResult};
use crate::output::OutputFormat;

#[derive(Parser)]
pub struct ChatCommand {
    #[clap(help = "Message to send")]
    pub message: String,

    #[clap(long, short = 'D', help = "Doctor profile (tenant) to consult")]
    pub doctor: Option<String>,

    #[clap(long, short, default_value = "medrelay-cli", help = "User id sent to the relay")]
    pub user: String,

    #[clap(long, help = "Continue an existing conversation")]
    pub conversation: Option<String>,

    #[clap(long, help = "Strip the citation block and fetch it separately")]
    pub no_references: bool,

    #[clap(long, help = "Use the single-shot endpoint instead of streaming")]
    pub single: bool,
}

/// What a finished stream delivered
#[derive(Debug, Default, PartialEq)]
pub struct StreamSummary {
    pub content: String,
    pub heartbeats: usize,
    pub frames: usize,
    pub usage: Option<Usage>,
    pub follow_ups: Vec<String>,
    pub error: Option<String>,
    pub ended_cleanly: bool,
}

impl ChatCommand {
    pub async fn execute(&self, client: &RelayClient, format: OutputFormat) -> CliResult<()> {
        let mut request = ChatRequest::new(self.message.clone(), self.user.clone());
        request.doctor_type = self.doctor.clone();
        request.conversation_id = self.conversation.clone();
        request.stream = !self.single;

        if self.single {
            return self.single_shot(client, &request, format).await;
        }

        let chat = client.stream(&request, !self.no_references).await?;
        let conversation_id = chat.conversation_id.clone();

        let mut stdout = std::io::stdout();
        let summary = match format {
            OutputFormat::Json => relay_frames(chat.frames, &mut stdout, true).await?,
            OutputFormat::Table => {
                let summary = relay_frames(chat.frames, &mut stdout, false).await?;
                println!();
                print_stream_footer(&summary, chat.request_id.as_deref(), conversation_id.as_deref());
                summary
            }
        };

        if let Some(error) = summary.error {
            return Err(CliError(format!("Relay reported an error: {error}")));
        }
        if !summary.ended_cleanly {
            return Err("Stream ended without an end-of-stream marker".into());
        }

        if let (true, Some(conversation_id)) = (self.no_references, conversation_id) {
            let references = client.references(&conversation_id).await?;
            if !references.references.is_empty() && matches!(format, OutputFormat::Table) {
                println!("\nReferences:\n{}", references.references);
            }
        }

        Ok(())
    }

    async fn single_shot(
        &self,
        client: &RelayClient,
        request: &ChatRequest,
        format: OutputFormat,
    ) -> CliResult<()> {
        let response = client.message(request, !self.no_references).await?;

        match format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&response)?);
            }
            OutputFormat::Table => {
                println!("{}", response.content);
                if !response.follow_up_questions.is_empty() {
                    println!("\nFollow-up questions:");
                    for question in &response.follow_up_questions {
                        println!("  - {question}");
                    }
                }
                if let Some(references) = &response.references {
                    println!("\nReferences:\n{references}");
                }
                println!("\nconversation: {}", response.conversation_id);
            }
        }
        Ok(())
    }
}

/// Drain a relay stream, writing message text (or raw frames) to `out`
///
/// Stops at the end-of-stream marker. An `error` frame is recorded in the
/// summary rather than returned, so the caller still sees what arrived
/// before it.
pub async fn relay_frames<W: Write>(
    mut frames: FrameStream,
    out: &mut W,
    raw: bool,
) -> CliResult<StreamSummary> {
    let mut summary = StreamSummary::default();

    while let Some(frame) = frames.next().await {
        let frame = frame?;
        summary.frames += 1;

        match &frame {
            StreamFrame::Heartbeat => summary.heartbeats += 1,
            StreamFrame::EndOfStream => {
                summary.ended_cleanly = true;
                if raw {
                    writeln!(out, "{}", serde_json::json!({"type": "end-of-stream"}))?;
                }
                break;
            }
            StreamFrame::Data(value) => {
                apply_data_frame(&mut summary, value);
                if raw {
                    writeln!(out, "{value}")?;
                } else if frame.kind() == Some("message") {
                    write!(out, "{}", value["content"].as_str().unwrap_or_default())?;
                    out.flush()?;
                }
            }
        }
    }

    Ok(summary)
}

fn apply_data_frame(summary: &mut StreamSummary, value: &Value) {
    match value["type"].as_str() {
        Some("message") => {
            summary
                .content
                .push_str(value["content"].as_str().unwrap_or_default());
        }
        Some("follow_up") | Some("complete") => {
            if let Some(questions) = value["follow_up_questions"].as_array() {
                summary
                    .follow_ups
                    .extend(questions.iter().filter_map(Value::as_str).map(str::to_string));
            }
            if let Ok(usage) = serde_json::from_value::<Usage>(value["usage"].clone()) {
                summary.usage = Some(usage);
            }
        }
        Some("error") => {
            summary.error = Some(
                value["error"]
                    .as_str()
                    .unwrap_or("unknown relay error")
                    .to_string(),
            );
        }
        _ => {}
    }
}

fn print_stream_footer(summary: &StreamSummary, request_id: Option<&str>, conversation_id: Option<&str>) {
    if !summary.follow_ups.is_empty() {
        println!("\nFollow-up questions:");
        for question in &summary.follow_ups {
            println!("  - {question}");
        }
    }

    println!();
    if let Some(usage) = summary.usage {
        println!(
            "tokens: {} ({} in / {} out)",
            usage.token_count, usage.input_count, usage.output_count
        );
    }
    println!(
        "frames: {}, heartbeats: {}",
        summary.frames, summary.heartbeats
    );
    if let Some(id) = conversation_id {
        println!("conversation: {id}");
    }
    if let Some(id) = request_id {
        println!("request: {id}");
    }
}
