//! Two headless editors sharing one room.
//!
//! Alice types at the end of the document, Bob turns the first block into a
//! heading and bolds a word with the keyboard shortcut. Both then print what
//! they see.

use std::error::Error;
use std::time::Duration;

use duet_collab::session::{CollabSession, SessionConfig};
use duet_core::render::to_html;
use duet_core::{BlockFormat, BlockKind, Hotkeys, KeyEvent, Modifiers, Point, Range, ToolbarAction};
use log::info;
use uuid::Uuid;

const SYNC_TIMEOUT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(250);

async fn join(server: &str, room: &str) -> Result<CollabSession, Box<dyn Error>> {
    let mut session = CollabSession::mount(SessionConfig {
        server_url: server.to_string(),
        room: room.to_string(),
        ..SessionConfig::default()
    })
    .await;
    if !session.wait_until_synced(SYNC_TIMEOUT).await? {
        session.unmount().await;
        return Err(format!("relay at {server} did not sync room {room}").into());
    }
    session.process_pending(QUIET).await?;
    Ok(session)
}

async fn settle(alice: &mut CollabSession, bob: &mut CollabSession) -> Result<(), Box<dyn Error>> {
    for _ in 0..2 {
        alice.process_pending(QUIET).await?;
        bob.process_pending(QUIET).await?;
    }
    Ok(())
}

pub async fn run(server: &str, room: Option<String>) -> Result<(), Box<dyn Error>> {
    let room = room.unwrap_or_else(|| format!("demo-{}", &Uuid::new_v4().simple().to_string()[..8]));
    info!("Demo in room {room} via {server}");

    let mut alice = join(server, &room).await?;
    let mut bob = join(server, &room).await?;

    alice
        .edit(|editor| {
            if let Some(end) = editor.document().last_point() {
                editor.select(Range::collapsed(end));
                editor.insert_text(" Alice was here.");
            }
        })
        .await?;

    bob.edit(|editor| {
        editor.select(Range::collapsed(Point::new(vec![0, 0], 0)));
        ToolbarAction::Block(BlockFormat::Kind(BlockKind::HeadingOne)).activate(editor);

        editor.select(Range::new(Point::new(vec![1, 0], 6), Point::new(vec![1, 0], 10)));
        let bold = KeyEvent {
            key: 'b',
            modifiers: Modifiers::MOD,
        };
        Hotkeys::default().handle(editor, &bold);
    })
    .await?;

    settle(&mut alice, &mut bob).await?;

    println!("alice ({}):\n{}\n", alice.client_id(), to_html(alice.document()));
    println!("bob ({}):\n{}\n", bob.client_id(), to_html(bob.document()));
    for cursor in alice.remote_cursors() {
        println!("alice sees {} ({}) at {:?}", cursor.name, cursor.color, cursor.caret);
    }

    let converged = alice.document() == bob.document();
    println!("converged: {converged}");

    alice.unmount().await;
    bob.unmount().await;

    if converged {
        Ok(())
    } else {
        Err("replicas diverged".into())
    }
}
