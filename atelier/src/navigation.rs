use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::debug;

/// Bottom tabs of the mini-app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MainTab {
    #[default]
    Home,
    Chat,
    More,
}

impl MainTab {
    fn order(&self) -> u8 {
        match self {
            MainTab::Home => 0,
            MainTab::Chat => 1,
            MainTab::More => 2,
        }
    }
}

/// Tabs of the artist detail screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DetailTab {
    #[default]
    Info,
    Request,
    Review,
    More,
}

impl DetailTab {
    fn order(&self) -> u8 {
        match self {
            DetailTab::Info => 0,
            DetailTab::Request => 1,
            DetailTab::Review => 2,
            DetailTab::More => 3,
        }
    }
}

/// Slide direction of a tab transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Forward,
    Backward,
}

impl Direction {
    fn between(current: u8, next: u8) -> Self {
        if next >= current {
            Direction::Forward
        } else {
            Direction::Backward
        }
    }
}

/// Commands the chat view listens for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NavCommand {
    OpenThread { chat_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetailScreen {
    pub artist_id: String,
    pub tab: DetailTab,
    pub direction: Direction,
}

/// Tab state, detail screen and the currently viewed chat.
///
/// The viewed-chat marker is a `watch` channel so the chat feed can react to
/// it; "start a chat" requests travel on a broadcast command bus.
pub struct NavigationController {
    main_tab: MainTab,
    main_direction: Direction,
    detail: Option<DetailScreen>,
    open_thread: watch::Sender<Option<String>>,
    commands: broadcast::Sender<NavCommand>,
}

impl Default for NavigationController {
    fn default() -> Self {
        Self::new()
    }
}

impl NavigationController {
    pub fn new() -> Self {
        let (open_thread, _) = watch::channel(None);
        let (commands, _) = broadcast::channel(16);
        Self {
            main_tab: MainTab::default(),
            main_direction: Direction::default(),
            detail: None,
            open_thread,
            commands,
        }
    }

    pub fn main_tab(&self) -> MainTab {
        self.main_tab
    }

    pub fn main_direction(&self) -> Direction {
        self.main_direction
    }

    pub fn detail(&self) -> Option<&DetailScreen> {
        self.detail.as_ref()
    }

    /// Marker of the chat currently on screen, for [`ChatFeed`](crate::feed::ChatFeed).
    pub fn open_thread(&self) -> watch::Receiver<Option<String>> {
        self.open_thread.subscribe()
    }

    pub fn current_open_thread(&self) -> Option<String> {
        self.open_thread.borrow().clone()
    }

    pub fn commands(&self) -> broadcast::Receiver<NavCommand> {
        self.commands.subscribe()
    }

    pub fn select_main_tab(&mut self, tab: MainTab) {
        if tab == self.main_tab {
            return;
        }

        self.main_direction = Direction::between(self.main_tab.order(), tab.order());
        if self.main_tab == MainTab::Chat {
            self.set_open_thread(None);
        }
        debug!(from = ?self.main_tab, to = ?tab, "Main tab changed");
        self.main_tab = tab;
    }

    /// Jump to the chat tab and ask the chat view to open `chat_id`.
    ///
    /// The command is sent after the tab switch, so a listener that reads the
    /// tab on receipt always sees `Chat`.
    pub fn start_chat(&mut self, chat_id: impl Into<String>) {
        let chat_id = chat_id.into();
        self.detail = None;
        self.select_main_tab(MainTab::Chat);

        debug!(chat_id = %chat_id, "Requesting chat thread");
        if self
            .commands
            .send(NavCommand::OpenThread { chat_id })
            .is_err()
        {
            debug!("No chat view listening for navigation commands");
        }
    }

    /// Called by the chat view when a thread is shown (`Some`) or hidden (`None`).
    ///
    /// A thread can only be on screen while the chat tab is selected.
    pub fn set_viewed_thread(&mut self, chat_id: Option<String>) {
        if chat_id.is_some() && self.main_tab != MainTab::Chat {
            debug!(?chat_id, "Ignoring viewed thread outside the chat tab");
            return;
        }
        self.set_open_thread(chat_id);
    }

    pub fn open_detail(&mut self, artist_id: impl Into<String>) {
        self.detail = Some(DetailScreen {
            artist_id: artist_id.into(),
            tab: DetailTab::default(),
            direction: Direction::Forward,
        });
    }

    pub fn select_detail_tab(&mut self, tab: DetailTab) {
        if let Some(detail) = self.detail.as_mut() {
            if detail.tab != tab {
                detail.direction = Direction::between(detail.tab.order(), tab.order());
                detail.tab = tab;
            }
        }
    }

    pub fn close_detail(&mut self) {
        self.detail = None;
    }

    fn set_open_thread(&self, chat_id: Option<String>) {
        self.open_thread.send_if_modified(|current| {
            if *current == chat_id {
                false
            } else {
                *current = chat_id;
                true
            }
        });
    }
}
