//! Viewer side of a connection
//!
//! [`ViewerSession`] runs the server half of the handshake and then decodes the
//! client's stream, keeping the collector and thread name tables up to date.
//! Every data frame is checked against those tables: an index the client has
//! not defined yet is a [`ProtocolError::UndefinedIndex`].

use framescope_common::{
    read_frame, write_frame, ClientMessage, CollectorDefinition, DataFrame, Hello, ServerHello,
    ServerMessage, ThreadDefinition, PROTOCOL_MAJOR, PROTOCOL_MINOR,
};
use std::collections::HashMap;
use std::io::{Read, Write};

use crate::domain::{ProtocolError, ViewerError};

/// One accepted client connection.
pub struct ViewerSession<S> {
    stream: S,
    hello: Hello,
    collectors: HashMap<u32, CollectorDefinition>,
    threads: HashMap<u32, ThreadDefinition>,
    frames: u64,
}

impl<S: Read + Write> ViewerSession<S> {
    /// Read the client's hello and answer it.
    ///
    /// # Errors
    /// A client with a different major protocol version is sent a `reject` and
    /// refused with [`ProtocolError::VersionMismatch`].
    pub fn accept(mut stream: S, server_name: &str) -> Result<Self, ViewerError> {
        let hello = match read_frame::<_, ClientMessage>(&mut stream)? {
            Some(ClientMessage::Hello(hello)) => hello,
            Some(other) => {
                return Err(ProtocolError::UnexpectedMessage {
                    expected: "client hello",
                    got: message_name(&other).to_string(),
                }
                .into());
            }
            None => return Err(ProtocolError::ClosedDuringHandshake.into()),
        };

        if hello.major != PROTOCOL_MAJOR {
            let reason = format!(
                "protocol {}.{} not supported (server speaks {PROTOCOL_MAJOR}.x)",
                hello.major, hello.minor
            );
            write_frame(&mut stream, &ServerMessage::Reject { reason })?;
            return Err(ProtocolError::VersionMismatch { local: PROTOCOL_MAJOR, remote: hello.major }
                .into());
        }

        write_frame(
            &mut stream,
            &ServerMessage::Hello(ServerHello {
                major: PROTOCOL_MAJOR,
                minor: PROTOCOL_MINOR,
                server: server_name.to_string(),
            }),
        )?;

        Ok(Self {
            stream,
            hello,
            collectors: HashMap::new(),
            threads: HashMap::new(),
            frames: 0,
        })
    }

    /// The client's handshake.
    pub fn hello(&self) -> &Hello {
        &self.hello
    }

    /// Next message from the client, `None` once the stream ends.
    ///
    /// # Errors
    /// Codec failures and data frames referencing undefined indices.
    pub fn next_message(&mut self) -> Result<Option<ClientMessage>, ViewerError> {
        let Some(msg) = read_frame::<_, ClientMessage>(&mut self.stream)? else {
            return Ok(None);
        };

        match &msg {
            ClientMessage::CollectorDef(def) => {
                self.collectors.insert(def.index, def.clone());
            }
            ClientMessage::ThreadDef(def) => {
                self.threads.insert(def.index, def.clone());
            }
            ClientMessage::Data(frame) => {
                self.check_indices(frame)?;
                self.frames += 1;
            }
            ClientMessage::Hello(_) => {
                return Err(ProtocolError::UnexpectedMessage {
                    expected: "definition or data",
                    got: "hello".to_string(),
                }
                .into());
            }
            ClientMessage::Goodbye => {}
        }
        Ok(Some(msg))
    }

    /// Next data frame, skipping definitions. `None` on goodbye or end of stream.
    ///
    /// # Errors
    /// As for [`next_message`](Self::next_message).
    pub fn next_data_frame(&mut self) -> Result<Option<DataFrame>, ViewerError> {
        loop {
            match self.next_message()? {
                Some(ClientMessage::Data(frame)) => return Ok(Some(frame)),
                Some(ClientMessage::Goodbye) | None => return Ok(None),
                Some(_) => {}
            }
        }
    }

    /// Ask the client to start or stop recording `collector`.
    ///
    /// # Errors
    /// Socket or encoding failures.
    pub fn set_active(&mut self, collector: u32, active: bool) -> Result<(), ViewerError> {
        write_frame(&mut self.stream, &ServerMessage::SetActive { collector, active })?;
        Ok(())
    }

    pub fn collector(&self, index: u32) -> Option<&CollectorDefinition> {
        self.collectors.get(&index)
    }

    pub fn collector_name(&self, index: u32) -> Option<&str> {
        self.collectors.get(&index).map(|d| d.name.as_str())
    }

    /// Index of the collector with the fully qualified `name`.
    pub fn collector_index(&self, name: &str) -> Option<u32> {
        self.collectors.values().find(|d| d.name == name).map(|d| d.index)
    }

    pub fn thread(&self, index: u32) -> Option<&ThreadDefinition> {
        self.threads.get(&index)
    }

    /// Data frames received so far.
    pub fn frames_received(&self) -> u64 {
        self.frames
    }

    fn check_indices(&self, frame: &DataFrame) -> Result<(), ProtocolError> {
        if !self.threads.contains_key(&frame.thread) {
            return Err(ProtocolError::UndefinedIndex { kind: "thread", index: frame.thread });
        }
        let collectors = frame
            .times
            .iter()
            .map(|t| t.collector)
            .chain(frame.levels.iter().map(|l| l.collector))
            .chain(frame.events.iter().map(|e| e.collector));
        for index in collectors {
            if !self.collectors.contains_key(&index) {
                return Err(ProtocolError::UndefinedIndex { kind: "collector", index });
            }
        }
        Ok(())
    }
}

fn message_name(msg: &ClientMessage) -> &'static str {
    match msg {
        ClientMessage::Hello(_) => "hello",
        ClientMessage::CollectorDef(_) => "collector_def",
        ClientMessage::ThreadDef(_) => "thread_def",
        ClientMessage::Data(_) => "data",
        ClientMessage::Goodbye => "goodbye",
    }
}
