use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use backend_http::{HttpBackend, HttpBackendOptions};
use config::AppConfig;
use core_orchestrator::{
    ClientContext, ClientOptions, PollOptions, QueryOptions, QueryOutcome, RegistrationForm,
    UploadPolicy,
};
use core_types::{
    ChatMessage, DocumentRecord, LlmProvider, SettingsUpdate, UploadFile, UserProfile,
    format_file_size,
};
use secrets::TokenVault;
use tracing::{info, warn};

use crate::{Command, DocsAction};

/// One CLI invocation: config, HTTP backend and the client state over it.
pub struct Shell {
    config: AppConfig,
    backend: Arc<HttpBackend>,
    client: ClientContext,
}

impl Shell {
    pub async fn open(config: AppConfig, vault: TokenVault) -> Result<Self> {
        let backend = Arc::new(HttpBackend::new(HttpBackendOptions {
            base_url: config.api.base_url.clone(),
            timeout: config.request_timeout(),
            upload_chunk_size: config.upload_chunk_bytes(),
        })?);
        let options = ClientOptions {
            upload_policy: UploadPolicy {
                max_size_bytes: config.max_upload_bytes(),
                allowed_extensions: config.uploads.allowed_extensions.clone(),
            },
            query_defaults: QueryOptions::top_k(config.query.default_top_k),
        };
        let client = ClientContext::start(backend.clone(), Arc::new(vault), options).await;
        Ok(Self {
            config,
            backend,
            client,
        })
    }

    pub async fn run(&self, command: Command) -> Result<()> {
        match command {
            Command::Register {
                username,
                email,
                password,
            } => self.register(username, email, password).await,
            Command::Login { username, password } => self.login(&username, password).await,
            Command::Logout => {
                self.client.logout();
                println!("Signed out.");
                Ok(())
            }
            Command::Whoami => self.whoami(),
            Command::Docs { action } => self.docs(action).await,
            Command::Ask {
                question,
                top_k,
                documents,
            } => self.ask(&question, top_k, documents).await,
            Command::Chat => self.chat().await,
            Command::Settings {
                email,
                openai_key,
                anthropic_key,
                endpoint,
                endpoint_key,
                provider,
                model,
            } => {
                let preferred_provider = provider
                    .as_deref()
                    .map(str::parse::<LlmProvider>)
                    .transpose()
                    .map_err(anyhow::Error::msg)?;
                let update = SettingsUpdate {
                    email,
                    openai_api_key: openai_key,
                    anthropic_api_key: anthropic_key,
                    custom_llm_endpoint: endpoint,
                    custom_llm_api_key: endpoint_key,
                    preferred_provider,
                    preferred_model: model,
                };
                self.settings(update).await
            }
            Command::Status => self.status().await,
        }
    }

    async fn register(
        &self,
        username: String,
        email: Option<String>,
        password: Option<String>,
    ) -> Result<()> {
        let (password, confirmation) = match password {
            Some(password) => (password.clone(), password),
            None => (prompt("Password")?, prompt("Confirm password")?),
        };
        let mut form = RegistrationForm::new(username, password).with_confirmation(confirmation);
        if let Some(email) = email {
            form = form.with_email(email);
        }
        let user = self.client.session.register(form).await?;
        println!("Created account `{}`. Sign in with `docqa login {}`.", user.username, user.username);
        Ok(())
    }

    async fn login(&self, username: &str, password: Option<String>) -> Result<()> {
        let password = match password {
            Some(password) => password,
            None => prompt("Password")?,
        };
        let user = self.client.session.login(username, &password).await?;
        println!("Signed in as {}.", user.username);
        if !user.has_llm_credential() {
            println!("No LLM key configured yet; run `docqa settings --openai-key ...` before asking.");
        }
        Ok(())
    }

    fn whoami(&self) -> Result<()> {
        let user = self.require_user()?;
        print_profile(&user);
        Ok(())
    }

    async fn docs(&self, action: DocsAction) -> Result<()> {
        self.require_user()?;
        let documents = &self.client.documents;
        match action {
            DocsAction::List => {
                let list = documents.refresh_list().await?;
                print_documents(&list);
            }
            DocsAction::Upload { path } => {
                let file = read_upload(&path)?;
                let name = file.filename.clone();
                let receipt = documents
                    .upload(file, move |percent| {
                        eprint!("\rUploading {name}: {percent:>3}%");
                        let _ = io::stderr().flush();
                    })
                    .await;
                eprintln!();
                let receipt = receipt?;
                println!(
                    "Uploaded `{}` as document {} ({}).",
                    receipt.filename,
                    receipt.id,
                    receipt.status.label()
                );
                if self.config.polling.enabled {
                    self.watch(self.config.poll_interval()).await?;
                }
            }
            DocsAction::Delete { id } => {
                documents.delete_document(id).await?;
                println!("Deleted document {id}.");
            }
            DocsAction::Show { id } => {
                let record = documents.fetch_document(id).await?;
                print_documents(std::slice::from_ref(&record));
            }
            DocsAction::Watch { interval_secs } => {
                let interval = interval_secs
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| self.config.poll_interval());
                self.watch(interval).await?;
            }
        }
        Ok(())
    }

    async fn watch(&self, interval: Duration) -> Result<()> {
        println!("Waiting for processing to finish (Ctrl-C to stop)...");
        let handle = self
            .client
            .documents
            .spawn_status_poll(PollOptions::every(interval).until_settled());
        tokio::select! {
            _ = handle.finished() => {}
            _ = tokio::signal::ctrl_c() => info!("status watch interrupted"),
        }
        if !self.client.session.is_authenticated() {
            bail!("session ended while watching");
        }
        print_documents(&self.client.documents.documents());
        Ok(())
    }

    async fn ask(&self, question: &str, top_k: Option<u32>, documents: Vec<i64>) -> Result<()> {
        let mut options = QueryOptions::top_k(top_k.unwrap_or(self.config.query.default_top_k));
        if !documents.is_empty() {
            options = options.within(documents);
        }
        match self.client.queries.submit_query_with(question, options).await? {
            QueryOutcome::Ignored => println!("Nothing to ask."),
            QueryOutcome::Answered(reply) => print_answer(&reply),
        }
        Ok(())
    }

    async fn chat(&self) -> Result<()> {
        self.require_user()?;
        println!("Ask away. `:clear` resets the conversation, `:quit` leaves.");
        let stdin = io::stdin();
        loop {
            print!("> ");
            io::stdout().flush()?;
            let mut line = String::new();
            if stdin.lock().read_line(&mut line)? == 0 {
                break;
            }
            match line.trim() {
                ":quit" | ":q" => break,
                ":clear" => {
                    self.client.queries.clear_transcript()?;
                    continue;
                }
                _ => {}
            }
            match self.client.queries.submit_query(&line).await {
                Ok(QueryOutcome::Answered(reply)) => print_answer(&reply),
                Ok(QueryOutcome::Ignored) => {}
                Err(err) if err.ends_session() => return Err(err.into()),
                Err(err) => eprintln!("error: {err}"),
            }
        }
        info!(
            turns = self.client.queries.transcript().len(),
            "chat session closed"
        );
        Ok(())
    }

    async fn settings(&self, update: SettingsUpdate) -> Result<()> {
        let user = self.client.settings.update_settings(update).await?;
        println!("Settings saved.");
        print_profile(&user);
        Ok(())
    }

    async fn status(&self) -> Result<()> {
        match self.backend.health().await {
            Ok(status) => println!("Backend {}: {status}", self.backend.base_url()),
            Err(err) => {
                warn!(error = %err, "health check failed");
                println!("Backend {}: unreachable ({err})", self.backend.base_url());
            }
        }
        match self.client.session.user() {
            Some(user) => println!("Signed in as {}.", user.username),
            None => match self.client.session.last_error() {
                Some(reason) => println!("Not signed in ({reason})."),
                None => println!("Not signed in."),
            },
        }
        Ok(())
    }

    fn require_user(&self) -> Result<UserProfile> {
        self.client
            .session
            .user()
            .context("not signed in; run `docqa login <username>` first")
    }
}

fn prompt(label: &str) -> Result<String> {
    eprint!("{label}: ");
    io::stderr().flush()?;
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read from stdin")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn read_upload(path: &Path) -> Result<UploadFile> {
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("`{}` has no usable file name", path.display()))?;
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(UploadFile::new(filename, bytes))
}

fn print_profile(user: &UserProfile) {
    println!("user:      {} (id {})", user.username, user.id);
    if let Some(email) = &user.email {
        println!("email:     {email}");
    }
    println!(
        "provider:  {} / {}",
        user.preferred_provider, user.preferred_model
    );
    let configured: Vec<&str> = [
        (user.has_openai_key, "openai"),
        (user.has_anthropic_key, "anthropic"),
        (user.has_custom_endpoint, "custom endpoint"),
    ]
    .into_iter()
    .filter_map(|(set, name)| set.then_some(name))
    .collect();
    if configured.is_empty() {
        println!("keys:      none");
    } else {
        println!("keys:      {}", configured.join(", "));
    }
}

fn print_documents(documents: &[DocumentRecord]) {
    if documents.is_empty() {
        println!("No documents uploaded yet.");
        return;
    }
    println!(
        "{:>6}  {:<40}  {:>10}  {:<10}  {:>6}  uploaded",
        "id", "filename", "size", "status", "chunks"
    );
    for doc in documents {
        let uploaded = doc
            .uploaded_at()
            .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:>6}  {:<40}  {:>10}  {:<10}  {:>6}  {uploaded}",
            doc.id,
            doc.filename,
            format_file_size(doc.file_size_bytes),
            doc.status.label(),
            doc.chunk_count
        );
    }
}

fn print_answer(reply: &ChatMessage) {
    println!("\n{}\n", reply.content);
    for source in &reply.sources {
        println!(
            "  {} ({} match)",
            source.location_label(),
            source.similarity_percent()
        );
        let snippet = source.text_snippet.trim();
        if !snippet.is_empty() {
            println!("    {snippet}");
        }
    }
}
