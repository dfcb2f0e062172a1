//! Durable per-session message store.
//!
//! Every session owns one store file holding each message it sent or
//! received, keyed by sequence number and direction. The on-disk format is
//! human-inspectable text: a `sender: <owner>` line, a blank line, then one
//! frame per line with SOH rendered as `^`. An in-memory index over the same
//! entries serves lookups in O(1) and feeds retransmission.

use anyhow::Result;

use crate::fix::mem::MsgBuf;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};

/// Which way a stored message travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Send,
    Recv,
}

enum StoreRequest {
    Add(u32, Direction, Arc<MsgBuf>, oneshot::Sender<Result<()>>),
    Get(u32, Direction, oneshot::Sender<Option<Vec<u8>>>),
    SentRange(u32, u32, oneshot::Sender<Vec<(u32, Vec<u8>)>>),
    Close(oneshot::Sender<Result<()>>),
}

/// Handle on a session's store. Cheap to clone; all clones talk to the same
/// backing task. After [`close`], reads keep working off the index but
/// further appends fail.
///
/// [`close`]: MessageStore::close
#[derive(Clone)]
pub struct MessageStore {
    sender: mpsc::UnboundedSender<StoreRequest>,
}

impl MessageStore {
    /// Creates the store file at `path` (parent directories included),
    /// writes the owner header and starts the backing task.
    pub async fn create(path: &Path, owner_id: &str) -> Result<MessageStore> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .await?;
        file.write_all(format!("sender: {}\n\n", owner_id).as_bytes())
            .await?;
        file.flush().await?;

        let (sender, mut receiver) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut file = Some(file);
            let mut index: HashMap<(Direction, u32), Arc<MsgBuf>> = HashMap::new();
            while let Some(req) = receiver.recv().await {
                match req {
                    StoreRequest::Add(seq, dir, msg, resp) => {
                        let result = match file.as_mut() {
                            Some(f) => append_frame(f, &msg).await,
                            None => Err(anyhow::anyhow!("store is closed")),
                        };
                        if result.is_ok() {
                            index.insert((dir, seq), msg);
                        }
                        let _ = resp.send(result);
                    }
                    StoreRequest::Get(seq, dir, resp) => {
                        let _ = resp.send(index.get(&(dir, seq)).map(|m| m.0.clone()));
                    }
                    StoreRequest::SentRange(begin, end, resp) => {
                        let mut out: Vec<(u32, Vec<u8>)> = index
                            .iter()
                            .filter(|((dir, seq), _)| {
                                *dir == Direction::Send && (begin..=end).contains(seq)
                            })
                            .map(|((_, seq), msg)| (*seq, msg.0.clone()))
                            .collect();
                        out.sort_by_key(|(seq, _)| *seq);
                        let _ = resp.send(out);
                    }
                    StoreRequest::Close(resp) => {
                        let result = match file.take() {
                            Some(mut f) => f.flush().await.map_err(|e| e.into()),
                            None => Ok(()),
                        };
                        let _ = resp.send(result);
                    }
                }
            }
        });

        Ok(MessageStore { sender })
    }

    /// Appends a message. The returned future resolves once the frame has
    /// been written and indexed, which is what lets the session guarantee
    /// received messages are stored before they reach the application.
    pub async fn add(&self, seq: u32, dir: Direction, msg: Arc<MsgBuf>) -> Result<()> {
        let (sender, receiver) = oneshot::channel();
        self.sender.send(StoreRequest::Add(seq, dir, msg, sender))?;
        receiver.await?
    }

    pub async fn get(&self, seq: u32, dir: Direction) -> Option<Vec<u8>> {
        let (sender, receiver) = oneshot::channel();
        self.sender.send(StoreRequest::Get(seq, dir, sender)).ok()?;
        receiver.await.ok()?
    }

    /// All sent messages with `begin <= seq <= end`, ascending.
    pub async fn sent_range(&self, begin: u32, end: u32) -> Result<Vec<(u32, Vec<u8>)>> {
        let (sender, receiver) = oneshot::channel();
        self.sender
            .send(StoreRequest::SentRange(begin, end, sender))?;
        Ok(receiver.await?)
    }

    /// Flushes and releases the file. Lookups stay available.
    pub async fn close(&self) -> Result<()> {
        let (sender, receiver) = oneshot::channel();
        self.sender.send(StoreRequest::Close(sender))?;
        receiver.await?
    }
}

async fn append_frame(file: &mut File, msg: &MsgBuf) -> Result<()> {
    let mut line = msg.render_soh('^');
    line.push('\n');
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn temp_store_path(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("anvilfix-store-{}-{}.fix", tag, std::process::id()))
    }

    fn buf(bytes: &[u8]) -> Arc<MsgBuf> {
        Arc::new(MsgBuf(bytes.to_vec()))
    }

    #[tokio::test]
    async fn test_add_get_round_trip() {
        let path = temp_store_path("round-trip");
        let store = MessageStore::create(&path, "Client").await.unwrap();

        let sent = buf(b"8=FIX.4.4\x019=5\x0135=D\x0110=000\x01");
        let received = buf(b"8=FIX.4.4\x019=5\x0135=8\x0110=001\x01");
        store.add(1, Direction::Send, Arc::clone(&sent)).await.unwrap();
        store
            .add(1, Direction::Recv, Arc::clone(&received))
            .await
            .unwrap();

        assert_eq!(store.get(1, Direction::Send).await, Some(sent.0.clone()));
        assert_eq!(
            store.get(1, Direction::Recv).await,
            Some(received.0.clone())
        );
        assert_eq!(store.get(2, Direction::Send).await, None);

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_on_disk_format() {
        let path = temp_store_path("format");
        let store = MessageStore::create(&path, "Server").await.unwrap();
        store
            .add(1, Direction::Recv, buf(b"8=FIX.4.4\x019=5\x0135=A\x0110=000\x01"))
            .await
            .unwrap();
        store.close().await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let mut lines = contents.lines();
        assert_eq!(lines.next(), Some("sender: Server"));
        assert_eq!(lines.next(), Some(""));
        assert_eq!(lines.next(), Some("8=FIX.4.4^9=5^35=A^10=000^"));
        assert_eq!(lines.next(), None);

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_sent_range_ascending() {
        let path = temp_store_path("range");
        let store = MessageStore::create(&path, "Client").await.unwrap();
        for seq in [3u32, 1, 2, 5] {
            let frame = format!("8=FIX.4.4\x019=7\x0134={}\x0110=000\x01", seq);
            store
                .add(seq, Direction::Send, buf(frame.as_bytes()))
                .await
                .unwrap();
        }
        store
            .add(2, Direction::Recv, buf(b"ignored-direction"))
            .await
            .unwrap();

        let range = store.sent_range(1, 3).await.unwrap();
        let seqs: Vec<u32> = range.iter().map(|(s, _)| *s).collect();
        assert_eq!(seqs, vec![1, 2, 3]);

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_reads_survive_close() {
        let path = temp_store_path("closed");
        let store = MessageStore::create(&path, "Client").await.unwrap();
        let msg = buf(b"8=FIX.4.4\x019=5\x0135=5\x0110=000\x01");
        store.add(4, Direction::Send, Arc::clone(&msg)).await.unwrap();
        store.close().await.unwrap();

        assert_eq!(store.get(4, Direction::Send).await, Some(msg.0.clone()));
        assert!(store.add(5, Direction::Send, msg).await.is_err());

        let _ = tokio::fs::remove_file(&path).await;
    }
}
