//! TCP control endpoint.
//!
//! The tracker listens on the receive port; when the experiment host
//! connects, the tracker opens the reply channel by connecting back to the
//! host on the send port. Exactly one client is served at a time; further
//! connection attempts are refused. All socket I/O is non-blocking and
//! polled from the main loop.
//!
//! Wire format: commands are null-terminated ASCII tokens; a command's
//! arguments arrive as additional null-terminated tokens with positional,
//! comma-separated fields. Replies are null-terminated strings, except the
//! image transfer which is a raw byte block ending in 0x00. Tokens are
//! buffered across reads, so a command split between two TCP segments still
//! parses.

use crate::error::{AppResult, GazeError};
use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

const RECV_BUFFER_SIZE: usize = 4096;
/// Timeout for the connect-back to the client's reply listener.
const SEND_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Forwarded keyboard input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Quit,
    Up,
    Down,
    Left,
    Right,
}

/// A parsed protocol command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Key(Key),
    GetImageData,
    StartCal {
        area: (i32, i32, i32, i32),
        clear: bool,
    },
    GetCalSample {
        x: f64,
        y: f64,
        samples: u32,
    },
    EndCal,
    StartVal {
        area: (i32, i32, i32, i32),
    },
    GetValSample {
        x: f64,
        y: f64,
        samples: u32,
    },
    EndVal,
    ToggleCalResult {
        show: bool,
    },
    SaveCalValResultsDetail,
    StartRecording {
        message: String,
    },
    StopRecording {
        message: String,
    },
    OpenDataFile {
        name: String,
        overwrite: bool,
    },
    CloseDataFile,
    InsertMessage {
        text: String,
    },
    InsertSettings {
        text: String,
    },
    GetEyePosition {
        average: usize,
    },
    GetEyePositionList {
        count: i64,
        with_pupil: bool,
    },
    GetWholeEyePositionList {
        with_pupil: bool,
    },
    GetWholeMessageList,
    GetCalResults,
    GetCalResultsDetail,
    GetCurrMenu,
    SaveCameraImage {
        name: String,
    },
    StartMeasurement,
    StopMeasurement,
    AllowRendering,
    InhibitRendering,
    IsBinocularMode,
    GetCameraImageSize,
    DeleteCalData {
        points: Vec<(f64, f64)>,
    },
}

struct ClientLink {
    recv: TcpStream,
    send: TcpStream,
    peer: IpAddr,
}

/// Result of one poll round.
pub struct Poll {
    pub commands: Vec<Command>,
    pub connection_lost: bool,
}

pub struct ControlServer {
    listener: TcpListener,
    send_port: u16,
    client: Option<ClientLink>,
    pending: Vec<u8>,
    tokens: VecDeque<String>,
}

impl ControlServer {
    /// Bind the listening socket. Fatal at startup when the port is taken.
    pub fn bind(recv_port: u16, send_port: u16) -> AppResult<Self> {
        let listener = TcpListener::bind(("0.0.0.0", recv_port))
            .map_err(|e| GazeError::Socket(format!("failed to bind port {recv_port}: {e}")))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| GazeError::Socket(format!("failed to set non-blocking: {e}")))?;
        log::info!("Listening on port {}.", listener.local_addr().map(|a| a.port()).unwrap_or(recv_port));
        Ok(Self {
            listener,
            send_port,
            client: None,
            pending: Vec::new(),
            tokens: VecDeque::new(),
        })
    }

    /// Port actually bound (useful with port 0 in tests).
    pub fn local_port(&self) -> u16 {
        self.listener.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Override the send port after bind (tests connect back to an
    /// ephemeral listener).
    pub fn set_send_port(&mut self, port: u16) {
        self.send_port = port;
    }

    pub fn has_client(&self) -> bool {
        self.client.is_some()
    }

    /// Accept/refuse pending connections, read available bytes and parse
    /// complete commands.
    pub fn poll(&mut self) -> Poll {
        self.accept_pending();
        let mut lost = false;
        if let Some(client) = &mut self.client {
            let mut chunk = [0u8; RECV_BUFFER_SIZE];
            loop {
                match client.recv.read(&mut chunk) {
                    Ok(0) => {
                        lost = true;
                        break;
                    }
                    Ok(n) => {
                        self.pending.extend_from_slice(&chunk[..n]);
                        if n < chunk.len() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => {
                        log::warn!("receive socket error: {e}");
                        lost = true;
                        break;
                    }
                }
            }
        }

        // Cut completed tokens out of the byte buffer.
        while let Some(pos) = self.pending.iter().position(|&b| b == 0) {
            let token: Vec<u8> = self.pending.drain(..=pos).collect();
            let token = String::from_utf8_lossy(&token[..token.len() - 1]).into_owned();
            self.tokens.push_back(token);
        }

        let commands = drain_commands(&mut self.tokens);
        if lost {
            log::info!("connection closed by peer");
            self.drop_client();
        }
        Poll {
            commands,
            connection_lost: lost,
        }
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    if self.client.is_some() {
                        log::warn!("refusing second client connection from {addr}");
                        drop(stream);
                        continue;
                    }
                    match self.open_client(stream, addr) {
                        Ok(client) => {
                            log::info!("Client IP address is {}.", client.peer);
                            self.client = Some(client);
                            self.pending.clear();
                            self.tokens.clear();
                        }
                        Err(e) => log::error!("failed to open client link: {e}"),
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn open_client(&self, recv: TcpStream, addr: SocketAddr) -> AppResult<ClientLink> {
        recv.set_nonblocking(true)
            .map_err(|e| GazeError::Socket(format!("failed to set non-blocking: {e}")))?;
        let send_addr = SocketAddr::new(addr.ip(), self.send_port);
        log::info!("Open sending socket to {send_addr}...");
        let send = TcpStream::connect_timeout(&send_addr, SEND_CONNECT_TIMEOUT)
            .map_err(|e| GazeError::Socket(format!("failed to open sending socket: {e}")))?;
        send.set_nodelay(true).ok();
        Ok(ClientLink {
            recv,
            send,
            peer: addr.ip(),
        })
    }

    fn drop_client(&mut self) {
        log::info!("Closing sockets... OK.");
        self.client = None;
        self.pending.clear();
        self.tokens.clear();
    }

    /// Send a null-terminated string reply.
    pub fn send_str(&mut self, reply: &str) {
        let mut bytes = reply.as_bytes().to_vec();
        bytes.push(0);
        self.send_raw(&bytes);
    }

    /// Send a raw block followed by the 0x00 terminator (image transfer).
    pub fn send_block(&mut self, block: &[u8]) {
        let mut bytes = block.to_vec();
        bytes.push(0);
        self.send_raw(&bytes);
    }

    fn send_raw(&mut self, bytes: &[u8]) {
        if let Some(client) = &mut self.client {
            if let Err(e) = client.send.write_all(bytes) {
                log::warn!("send socket error: {e}");
            }
        } else {
            log::warn!("reply dropped: no client connected");
        }
    }
}

/// Number of argument tokens that follow a command token.
fn arg_tokens(command: &str) -> usize {
    match command {
        "startCal" | "getCalSample" | "getValSample" | "openDataFile" | "getEyePositionList" => 2,
        "startVal" | "toggleCalResult" | "startRecording" | "stopRecording" | "insertMessage"
        | "insertSettings" | "getEyePosition" | "getWholeEyePositionList" | "saveCameraImage"
        | "deleteCalData" => 1,
        _ => 0,
    }
}

/// Parse as many complete commands as the token queue holds. Tokens of a
/// command whose arguments have not all arrived stay queued.
fn drain_commands(tokens: &mut VecDeque<String>) -> Vec<Command> {
    let mut commands = Vec::new();
    while let Some(front) = tokens.front() {
        let needed = arg_tokens(front);
        if tokens.len() < needed + 1 {
            break;
        }
        let name = tokens.pop_front().unwrap_or_default();
        let mut args: Vec<String> = Vec::with_capacity(needed);
        for _ in 0..needed {
            args.push(tokens.pop_front().unwrap_or_default());
        }
        if let Some(cmd) = parse_command(&name, &args) {
            commands.push(cmd);
        } else {
            log::warn!("Unknown command ({name})");
        }
    }
    commands
}

fn parse_command(name: &str, args: &[String]) -> Option<Command> {
    let arg = |i: usize| args.get(i).map(String::as_str).unwrap_or("");
    Some(match name {
        "key_Q" => Command::Key(Key::Quit),
        "key_UP" => Command::Key(Key::Up),
        "key_DOWN" => Command::Key(Key::Down),
        "key_LEFT" => Command::Key(Key::Left),
        "key_RIGHT" => Command::Key(Key::Right),
        "getImageData" => Command::GetImageData,
        "startCal" => Command::StartCal {
            area: parse_area(arg(0)),
            clear: arg(1).trim() == "1",
        },
        "getCalSample" => {
            let (x, y) = parse_xy(arg(0));
            Command::GetCalSample {
                x,
                y,
                samples: parse_samples(arg(1)),
            }
        }
        "endCal" => Command::EndCal,
        "startVal" => Command::StartVal {
            area: parse_area(arg(0)),
        },
        "getValSample" => {
            let (x, y) = parse_xy(arg(0));
            Command::GetValSample {
                x,
                y,
                samples: parse_samples(arg(1)),
            }
        }
        "endVal" => Command::EndVal,
        "toggleCalResult" => Command::ToggleCalResult {
            show: arg(0).trim().parse::<i32>().unwrap_or(0) != 0,
        },
        "saveCalValResultsDetail" => Command::SaveCalValResultsDetail,
        "startRecording" => Command::StartRecording {
            message: arg(0).to_string(),
        },
        "stopRecording" => Command::StopRecording {
            message: arg(0).to_string(),
        },
        "openDataFile" => Command::OpenDataFile {
            name: arg(0).to_string(),
            overwrite: arg(1).trim().parse::<i32>().unwrap_or(0) != 0,
        },
        "closeDataFile" => Command::CloseDataFile,
        "insertMessage" => Command::InsertMessage {
            text: arg(0).to_string(),
        },
        "insertSettings" => Command::InsertSettings {
            text: arg(0).to_string(),
        },
        "getEyePosition" => Command::GetEyePosition {
            average: arg(0).trim().parse::<i64>().unwrap_or(1).max(1) as usize,
        },
        "getEyePositionList" => Command::GetEyePositionList {
            count: arg(0).trim().parse::<i64>().unwrap_or(0),
            with_pupil: arg(1).starts_with('1'),
        },
        "getWholeEyePositionList" => Command::GetWholeEyePositionList {
            with_pupil: arg(0).starts_with('1'),
        },
        "getWholeMessageList" => Command::GetWholeMessageList,
        "getCalResults" => Command::GetCalResults,
        "getCalResultsDetail" => Command::GetCalResultsDetail,
        "getCurrMenu" => Command::GetCurrMenu,
        "saveCameraImage" => Command::SaveCameraImage {
            name: arg(0).to_string(),
        },
        "startMeasurement" => Command::StartMeasurement,
        "stopMeasurement" => Command::StopMeasurement,
        "allowRendering" => Command::AllowRendering,
        "inhibitRendering" => Command::InhibitRendering,
        "isBinocularMode" => Command::IsBinocularMode,
        "getCameraImageSize" => Command::GetCameraImageSize,
        "deleteCalData" => Command::DeleteCalData {
            points: parse_points(arg(0)),
        },
        _ => return None,
    })
}

fn parse_area(s: &str) -> (i32, i32, i32, i32) {
    let mut it = s.split(',').map(|v| v.trim().parse::<i32>().unwrap_or(0));
    (
        it.next().unwrap_or(0),
        it.next().unwrap_or(0),
        it.next().unwrap_or(0),
        it.next().unwrap_or(0),
    )
}

fn parse_xy(s: &str) -> (f64, f64) {
    let mut it = s.split(',').map(|v| v.trim().parse::<f64>().unwrap_or(0.0));
    (it.next().unwrap_or(0.0), it.next().unwrap_or(0.0))
}

fn parse_samples(s: &str) -> u32 {
    s.trim().parse::<i64>().unwrap_or(1).max(1) as u32
}

fn parse_points(s: &str) -> Vec<(f64, f64)> {
    let values: Vec<f64> = s
        .split(',')
        .filter_map(|v| v.trim().parse::<f64>().ok())
        .collect();
    values.chunks_exact(2).map(|c| (c[0], c[1])).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(tokens: &[&str]) -> VecDeque<String> {
        tokens.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_zero_arg_commands() {
        let mut q = queue(&["endCal", "isBinocularMode", "key_UP"]);
        let cmds = drain_commands(&mut q);
        assert_eq!(
            cmds,
            vec![
                Command::EndCal,
                Command::IsBinocularMode,
                Command::Key(Key::Up)
            ]
        );
        assert!(q.is_empty());
    }

    #[test]
    fn test_start_cal_takes_two_tokens() {
        let mut q = queue(&["startCal", "0,0,1024,768", "1"]);
        let cmds = drain_commands(&mut q);
        assert_eq!(
            cmds,
            vec![Command::StartCal {
                area: (0, 0, 1024, 768),
                clear: true
            }]
        );
    }

    #[test]
    fn test_partial_command_waits_for_arguments() {
        let mut q = queue(&["getCalSample", "320,240"]);
        let cmds = drain_commands(&mut q);
        assert!(cmds.is_empty());
        assert_eq!(q.len(), 2);
        q.push_back("10".to_string());
        let cmds = drain_commands(&mut q);
        assert_eq!(
            cmds,
            vec![Command::GetCalSample {
                x: 320.0,
                y: 240.0,
                samples: 10
            }]
        );
    }

    #[test]
    fn test_unknown_command_is_skipped() {
        let mut q = queue(&["fooBar", "endVal"]);
        let cmds = drain_commands(&mut q);
        assert_eq!(cmds, vec![Command::EndVal]);
    }

    #[test]
    fn test_negative_list_count_kept_signed() {
        let mut q = queue(&["getEyePositionList", "-50", "1"]);
        let cmds = drain_commands(&mut q);
        assert_eq!(
            cmds,
            vec![Command::GetEyePositionList {
                count: -50,
                with_pupil: true
            }]
        );
    }

    #[test]
    fn test_delete_cal_data_parses_pairs() {
        let mut q = queue(&["deleteCalData", "100,100,512,384"]);
        let cmds = drain_commands(&mut q);
        assert_eq!(
            cmds,
            vec![Command::DeleteCalData {
                points: vec![(100.0, 100.0), (512.0, 384.0)]
            }]
        );
    }

    #[test]
    fn test_open_data_file_name_then_overwrite() {
        let mut q = queue(&["openDataFile", "run3.csv", "0"]);
        let cmds = drain_commands(&mut q);
        assert_eq!(
            cmds,
            vec![Command::OpenDataFile {
                name: "run3.csv".to_string(),
                overwrite: false
            }]
        );
    }

    #[test]
    fn test_samples_clamped_to_at_least_one() {
        let mut q = queue(&["getValSample", "1,2", "-5"]);
        let cmds = drain_commands(&mut q);
        assert_eq!(
            cmds,
            vec![Command::GetValSample {
                x: 1.0,
                y: 2.0,
                samples: 1
            }]
        );
    }
}
