use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use log::info;
use tokio::io::{stdin, AsyncBufReadExt, BufReader};
use tokio::time::{interval, Duration};

use donation_client::client::config::ClientConfig;
use donation_client::client::models::conversation::{Conversation, OWN_LABEL};
use donation_client::client::services::auth_service::AuthService;
use donation_client::client::services::chat_service::ChatService;
use donation_client::client::services::donation_service::DonationService;
use donation_client::client::services::http::ApiClient;
use donation_client::client::services::post_service::PostService;
use donation_client::client::services::upload_service::{UploadFile, UploadService};
use donation_client::client::services::users_service::UsersService;
use donation_client::client::utils::session_store::{KeyringSessionStore, Session, SessionStore};
use donation_client::common::models::{Post, ProfileUpdate, RegisterRequest};
use donation_client::utils::logger;

const HELP: &str = "\
Account:   /login <email> <password> | /register <first> <last> <email> <password> | /logout | /whoami
           /verify <token> | /resend <email> | /forgot <email> | /reset <token> <new> <confirm> | /passwd <old> <new>
Posts:     /posts | /my_posts [email] | /item <id> | /categories | /conditions | /delete_post <id>
           /create_post <category> <condition> <title> | <description>
Interest:  /interest <item_id> | /interested <item_id> | /donate <user_id> <item_id> | /donations
Profile:   /profile [email] | /set_name <first> <last> | /upload <folder> <file>
Chat:      /recipients | /chat <email> | /say <text> | /close
Other:     /help | /quit";

fn parse_id(raw: &str, what: &str) -> anyhow::Result<i64> {
    raw.parse::<i64>()
        .with_context(|| format!("{} id must be a number, got '{}'", what, raw))
}

struct Cli {
    config: ClientConfig,
    api: ApiClient,
    store: Arc<dyn SessionStore>,
    auth: AuthService,
    chat: ChatService,
    session: Option<Session>,
    conversation: Option<Conversation>,
    seen: usize,
}

impl Cli {
    fn new(config: ClientConfig) -> anyhow::Result<Self> {
        let api = ApiClient::new(&config.api_base_url, config.http_timeout)?;
        let store: Arc<dyn SessionStore> =
            Arc::new(KeyringSessionStore::new(&config.data_dir, config.keyring_fallback));
        let auth = AuthService::new(api.clone(), store.clone());
        let chat = ChatService::from_config(&config)?;
        let session = auth.current_session().unwrap_or_else(|e| {
            println!("[CLIENT][ERROR] {}", e);
            None
        });
        Ok(Self {
            config,
            api,
            store,
            auth,
            chat,
            session,
            conversation: None,
            seen: 0,
        })
    }

    /// Authenticated client, or `None` with a hint printed.
    fn authed(&self) -> Option<(ApiClient, &Session)> {
        match &self.session {
            Some(session) => Some((self.api.with_token(&session.token), session)),
            None => {
                println!("[CLIENT] Please /login first.");
                None
            }
        }
    }

    fn print_posts(posts: &[Post]) {
        if posts.is_empty() {
            println!("[CLIENT] No posts found.");
            return;
        }
        for p in posts {
            println!(
                "  #{:<5} {} [{} / {}] by {}",
                p.id.map(|id| id.to_string()).unwrap_or_default(),
                p.title,
                p.category,
                p.condition,
                p.user_name.as_deref().unwrap_or(&p.email)
            );
        }
    }

    fn flush_conversation(&mut self) {
        if let Some(conv) = &self.conversation {
            let entries = conv.entries();
            for entry in entries.iter().skip(self.seen) {
                if entry.sender != OWN_LABEL {
                    println!("[{}] {}", entry.sender, entry.content);
                }
            }
            self.seen = entries.len();
        }
    }

    async fn close_conversation(&mut self) {
        if let Some(conv) = self.conversation.take() {
            conv.close(self.chat.connection());
            println!("[CLIENT] Closed chat with {}", conv.peer());
        }
        self.seen = 0;
    }

    /// Returns `false` when the user asked to quit.
    async fn handle(&mut self, command: &str, args: &[&str], rest: &str) -> anyhow::Result<bool> {
        match (command, args) {
            ("/help", _) => println!("{}", HELP),
            ("/quit", _) => return Ok(false),
            ("/login", [email, password]) => {
                let session = self.auth.login(email, password).await?;
                println!("[CLIENT] Logged in as {}", session.user.email);
                self.session = Some(session);
            }
            ("/register", [first, last, email, password]) => {
                let request = RegisterRequest {
                    first_name: first.to_string(),
                    last_name: last.to_string(),
                    email: email.to_string(),
                    password: password.to_string(),
                };
                let session = self.auth.register(&request).await?;
                println!("[CLIENT] Signup successful! Please check your email to verify your account.");
                self.session = Some(session);
            }
            ("/logout", _) => {
                self.close_conversation().await;
                self.chat.connection().disconnect().await;
                self.auth.logout()?;
                self.session = None;
                println!("[CLIENT] Logged out.");
            }
            ("/whoami", _) => match &self.session {
                Some(s) => println!("[CLIENT] {} (id {})", s.user.email, s.user.id),
                None => println!("[CLIENT] Not logged in."),
            },
            ("/verify", [token]) => println!("[SERVER] {}", self.auth.verify_email(token).await?),
            ("/resend", [email]) => println!("[SERVER] {}", self.auth.resend_verification_email(email).await?),
            ("/forgot", [email]) => println!("[SERVER] {}", self.auth.forgot_password(email).await?),
            ("/reset", [token, new, confirm]) => {
                println!("[SERVER] {}", self.auth.reset_password(token, new, confirm).await?)
            }
            ("/passwd", [old, new]) => {
                self.auth.change_password(old, new).await?;
                println!("[CLIENT] Password updated.");
            }
            ("/posts", _) => Self::print_posts(&PostService::new(self.api.clone()).fetch_posts().await?),
            ("/my_posts", _) => {
                let email = match (args.first(), &self.session) {
                    (Some(email), _) => email.to_string(),
                    (None, Some(s)) => s.user.email.clone(),
                    (None, None) => {
                        println!("[CLIENT] Usage: /my_posts <email> (or /login first)");
                        return Ok(true);
                    }
                };
                let posts = PostService::new(self.api.clone())
                    .fetch_posts_by_email(&email)
                    .await?;
                Self::print_posts(&posts);
            }
            ("/item", [id]) => {
                let post = PostService::new(self.api.clone())
                    .get_item(parse_id(id, "item")?)
                    .await?;
                println!("  {}\n  {}\n  {} / {} at {}", post.title, post.description, post.category, post.condition,
                    post.address.as_deref().unwrap_or("-"));
            }
            ("/categories", _) => {
                let list = PostService::new(self.api.clone()).fetch_categories().await?;
                println!("  {}", list.join(", "));
            }
            ("/conditions", _) => {
                let list = PostService::new(self.api.clone()).fetch_conditions().await?;
                println!("  {}", list.join(", "));
            }
            ("/create_post", [category, condition, ..]) => {
                let Some((api, session)) = self.authed() else { return Ok(true) };
                let text = rest
                    .splitn(3, char::is_whitespace)
                    .nth(2)
                    .unwrap_or("");
                let (title, description) = text.split_once('|').unwrap_or((text, ""));
                let post = Post {
                    title: title.trim().to_string(),
                    description: description.trim().to_string(),
                    category: category.to_string(),
                    condition: condition.to_string(),
                    email: session.user.email.clone(),
                    address: session.user.address.clone(),
                    ..Default::default()
                };
                PostService::new(api).create_post(&post).await?;
                println!("[CLIENT] Post created.");
            }
            ("/delete_post", [id]) => {
                let Some((api, _)) = self.authed() else { return Ok(true) };
                PostService::new(api)
                    .delete_post(parse_id(id, "post")?)
                    .await?;
                println!("[CLIENT] Post deleted.");
            }
            ("/interest", [item]) => {
                let Some((api, session)) = self.authed() else { return Ok(true) };
                let donation = DonationService::new(api)
                    .create_donation(parse_id(item, "item")?, session.user.id)
                    .await?;
                println!("[CLIENT] Interest registered (request #{}).", donation.id);
            }
            ("/interested", [item]) => {
                let list = DonationService::new(self.api.clone())
                    .interested_users(parse_id(item, "item")?)
                    .await?;
                if list.is_empty() {
                    println!("[CLIENT] Nobody asked for this item yet.");
                }
                for d in list {
                    let status = d.status.map(|s| s.description()).unwrap_or("-");
                    println!("  user #{:<5} {:<30} {}", d.user.id, d.user.email, status);
                }
            }
            ("/donate", [user, item]) => {
                let Some((api, _)) = self.authed() else { return Ok(true) };
                let donation = DonationService::new(api)
                    .donate(
                        parse_id(user, "user")?,
                        parse_id(item, "item")?,
                    )
                    .await?;
                println!("[CLIENT] Donation #{} is {}.", donation.id,
                    donation.status.map(|s| s.to_string()).unwrap_or_default());
            }
            ("/donations", _) => {
                let Some((api, session)) = self.authed() else { return Ok(true) };
                let list = DonationService::new(api).donations_by_user(session.user.id).await?;
                for d in list {
                    println!("  #{:<5} {} -> {}", d.id, d.item_post.title,
                        d.status.map(|s| s.to_string()).unwrap_or_default());
                }
            }
            ("/profile", _) => {
                let email = match (args.first(), &self.session) {
                    (Some(email), _) => email.to_string(),
                    (None, Some(s)) => s.user.email.clone(),
                    (None, None) => {
                        println!("[CLIENT] Usage: /profile <email> (or /login first)");
                        return Ok(true);
                    }
                };
                let profile = UsersService::new(self.api.clone()).get_profile(&email).await?;
                println!("  {} <{}>", profile.display_name().unwrap_or_default(), profile.email);
            }
            ("/set_name", [first, last]) => {
                let Some((api, session)) = self.authed() else { return Ok(true) };
                let update = ProfileUpdate {
                    first_name: Some(first.to_string()),
                    last_name: Some(last.to_string()),
                    ..Default::default()
                };
                UsersService::new(api).update_profile(&session.user.email, &update).await?;
                self.session = self.store.update_user(&update)?;
                println!("[CLIENT] Profile updated.");
            }
            ("/upload", [folder, path]) => {
                let bytes = tokio::fs::read(path).await.with_context(|| format!("reading {}", path))?;
                let name = std::path::Path::new(path)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.to_string());
                let storage = ApiClient::new(&self.config.storage_base_url, self.config.http_timeout)?;
                let url = UploadService::new(storage, &self.config.storage_bucket)
                    .upload(&UploadFile::new(name, bytes), folder)
                    .await?;
                println!("[CLIENT] Uploaded: {}", url);
            }
            ("/recipients", _) => {
                let Some((_, session)) = self.authed() else { return Ok(true) };
                let list = self.chat.recipients_by_sender(&session.user.email).await?;
                if list.is_empty() {
                    println!("[CLIENT] No conversations yet.");
                }
                for r in list {
                    println!("  {}", r);
                }
            }
            ("/chat", [peer]) => {
                let Some((_, session)) = self.authed() else { return Ok(true) };
                let me = session.user.email.clone();
                self.close_conversation().await;
                let summary = self.chat.user_summary(peer).await;
                let name = summary.display_name().unwrap_or_else(|| peer.to_string());
                let conv = Conversation::new(me.clone(), peer.to_string(), name.clone());
                match self.chat.chat_messages(&me, peer).await {
                    Ok(history) => conv.load_history(history),
                    Err(e) => println!("[CLIENT][ERROR] Failed to load messages: {}", e),
                }
                for entry in conv.entries() {
                    println!("[{}] {}", entry.sender, entry.content);
                }
                self.seen = conv.len();
                conv.open(self.chat.connection()).await?;
                println!("[CLIENT] Chatting with {}. Use /say <text>, /close to leave.", name);
                self.conversation = Some(conv);
            }
            ("/say", [_, ..]) => {
                let Some(conv) = self.conversation.clone() else {
                    println!("[CLIENT] Open a chat with /chat <email> first.");
                    return Ok(true);
                };
                self.flush_conversation();
                let text = rest.split_once(char::is_whitespace).map(|x| x.1).unwrap_or("");
                if let Err(e) = conv.send_text(self.chat.connection(), text).await {
                    println!("[CLIENT][ERROR] Failed to send message: {}", e);
                }
                self.seen = conv.len();
            }
            ("/close", _) => self.close_conversation().await,
            _ => println!("[CLIENT] Invalid command syntax. Type /help."),
        }
        Ok(true)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ClientConfig::from_env();
    logger::init(&config.log_level);
    info!("API {} / chat {}", config.api_base_url, config.websocket_base_url);

    let mut cli = Cli::new(config)?;
    println!("[CLIENT] Welcome! Type /help for the list of commands.");
    if let Some(s) = &cli.session {
        println!("[CLIENT] Resumed session for {}", s.user.email);
    }

    let mut input = BufReader::new(stdin()).lines();
    let mut tick = interval(Duration::from_millis(500));
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let line = loop {
            tokio::select! {
                line = input.next_line() => break line?,
                _ = tick.tick() => cli.flush_conversation(),
            }
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        let (command, args) = (parts[0], &parts[1..]);
        match cli.handle(command, args, line).await {
            Ok(true) => {}
            Ok(false) => break,
            // failures never end the session; report and keep state
            Err(e) => println!("[CLIENT][ERROR] {}", e),
        }
    }

    cli.close_conversation().await;
    cli.chat.connection().disconnect().await;
    println!("[CLIENT] Bye.");
    Ok(())
}
