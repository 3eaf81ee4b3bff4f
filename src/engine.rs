use crate::error::{Error, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, select, unbounded};
use log::{error, trace, warn};
use std::env;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use wait_timeout::ChildExt;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const READY_TIMEOUT: Duration = Duration::from_secs(10);
const BESTMOVE_GRACE: Duration = Duration::from_secs(5);
const QUIT_GRACE: Duration = Duration::from_secs(2);

// Engine output is mirrored into a bounded log channel drained by the
// command loop; when the loop falls behind, lines are dropped rather than
// blocking the reader.
const LOG_CHANNEL_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Score {
    #[default]
    None,
    Cp(i32),
    Mate(i32),
}

/// Stats reported by the engine for a single bestmove search.
#[derive(Debug, Clone, Default)]
pub struct MoveRecord {
    pub uci: String,
    pub score: Score,
    pub depth: u32,
    pub seldepth: u32,
    pub nodes: u64,
    pub nps: u64,
    pub engine_time: u64,
    pub hashfull: u32,
}

#[derive(Debug, Clone)]
pub enum PlayOutcome {
    Move(MoveRecord),
    Resigned,
}

/// One multipv candidate line from a running analysis.
#[derive(Debug, Clone, Default)]
pub struct AnalysisLine {
    pub multipv: u32,
    pub depth: u32,
    pub score: Score,
    pub nodes: u64,
    pub nps: u64,
    pub pv: Vec<String>,
}

/// Search limit passed to `go`. Fixed per-move settings plus, when clocks
/// are in play, the live remaining times of both sides.
#[derive(Debug, Clone, Default)]
pub struct Limit {
    pub time: Option<Duration>,
    pub depth: Option<u32>,
    pub nodes: Option<u64>,
    pub clocks: Option<GoClocks>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GoClocks {
    pub wtime: Duration,
    pub btime: Duration,
    pub winc: Duration,
    pub binc: Duration,
}

impl Limit {
    pub fn movetime(time: Duration) -> Limit {
        Limit {
            time: Some(time),
            ..Limit::default()
        }
    }

    fn go_string(&self) -> String {
        let mut parts: Vec<String> = vec![];
        if let Some(clocks) = &self.clocks {
            parts.push(format!(
                "wtime {} btime {} winc {} binc {}",
                clocks.wtime.as_millis(),
                clocks.btime.as_millis(),
                clocks.winc.as_millis(),
                clocks.binc.as_millis()
            ));
        }
        if let Some(time) = self.time {
            parts.push(format!("movetime {}", time.as_millis()));
        }
        if let Some(depth) = self.depth {
            parts.push(format!("depth {depth}"));
        }
        if let Some(nodes) = self.nodes {
            parts.push(format!("nodes {nodes}"));
        }
        if parts.is_empty() {
            String::from("infinite")
        } else {
            parts.join(" ")
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct EngineBuilder {
    pub dir: Option<String>,
    pub cmd: String,
    pub name: Option<String>,
    pub uci_options: Vec<(String, String)>,
}

impl EngineBuilder {
    pub fn new(cmd: &str) -> EngineBuilder {
        EngineBuilder {
            cmd: cmd.to_string(),
            ..EngineBuilder::default()
        }
    }

    pub fn open(&self) -> Result<Engine> {
        let proc_err = |e: std::io::Error| Error::EngineProcess {
            name: self.name.clone().unwrap_or_else(|| self.cmd.clone()),
            source: e,
        };

        let mut command = Command::new(&self.cmd);
        if let Some(dir) = &self.dir {
            command.current_dir(env::current_dir().map_err(proc_err)?.join(dir));
        }
        let mut child = command
            .stdout(Stdio::piped())
            .stdin(Stdio::piped())
            .spawn()
            .map_err(proc_err)?;

        let stdout = BufReader::new(child.stdout.take().unwrap());
        let stdin = child.stdin.take().unwrap();
        let name = self.name.clone().unwrap_or_else(|| self.cmd.clone());

        let (line_tx, line_rx) = unbounded();
        let (log_tx, log_rx) = bounded(LOG_CHANNEL_CAPACITY);
        let reader = thread::spawn({
            let name = name.clone();
            move || reader_thread(name, stdout, line_tx, log_tx)
        });

        let mut engine = Engine {
            name,
            child,
            stdin: Arc::new(Mutex::new(stdin)),
            lines: line_rx,
            log_rx,
            reader: Some(reader),
            builder: self.clone(),
        };

        engine.write_line("uci")?;
        loop {
            let line = engine.recv_line(HANDSHAKE_TIMEOUT)?;
            let mut it = line.split_whitespace();
            match it.next() {
                Some("uciok") => break,
                Some("id") => {
                    if it.next() == Some("name") && self.name.is_none() {
                        let rest: Vec<&str> = it.collect();
                        if !rest.is_empty() {
                            engine.name = rest.join(" ");
                        }
                    }
                }
                _ => {}
            }
        }

        for (k, v) in &self.uci_options {
            engine.set_option(k, v)?;
        }
        engine.isready()?;

        Ok(engine)
    }
}

fn reader_thread(
    name: String,
    mut stdout: BufReader<impl std::io::Read>,
    line_tx: Sender<String>,
    log_tx: Sender<String>,
) {
    loop {
        let mut line = String::new();
        match stdout.read_line(&mut line) {
            Ok(0) => {
                trace!("{name} closed its stdout");
                return;
            }
            Ok(_) => {
                let line = line.trim_end().to_string();
                trace!("{name} > {line}");
                if log_tx.try_send(line.clone()).is_err() && log_tx.is_full() {
                    warn!("{name}: log channel full, dropping line");
                }
                if line_tx.send(line).is_err() {
                    return;
                }
            }
            Err(e) => {
                error!("{name}: read failed: {e}");
                return;
            }
        }
    }
}

/// A running UCI engine process.
///
/// The reader thread owns stdout; callers consume parsed lines through the
/// protocol channel. At most one request (play or analyse) may be
/// outstanding at a time; the coordinator and the analysis manager keep
/// that invariant between them.
#[derive(Debug)]
pub struct Engine {
    name: String,
    child: Child,
    stdin: Arc<Mutex<ChildStdin>>,
    lines: Receiver<String>,
    log_rx: Receiver<String>,
    reader: Option<JoinHandle<()>>,
    builder: EngineBuilder,
}

impl Engine {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn builder(&self) -> &EngineBuilder {
        &self.builder
    }

    /// Receiver for the bounded engine-output log channel.
    pub fn log_lines(&self) -> Receiver<String> {
        self.log_rx.clone()
    }

    fn proc_err(&self, e: std::io::Error) -> Error {
        Error::EngineProcess {
            name: self.name.clone(),
            source: e,
        }
    }

    fn disconnected(&self) -> Error {
        self.proc_err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "engine process disconnected",
        ))
    }

    pub fn write_line(&self, line: &str) -> Result<()> {
        trace!("{} < {line}", self.name);
        let mut stdin = self.stdin.lock().unwrap();
        writeln!(stdin, "{line}").map_err(|e| self.proc_err(e))?;
        stdin.flush().map_err(|e| self.proc_err(e))
    }

    fn recv_line(&self, timeout: Duration) -> Result<String> {
        match self.lines.recv_timeout(timeout) {
            Ok(line) => Ok(line),
            Err(RecvTimeoutError::Timeout) => Err(self.proc_err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "engine did not answer in time",
            ))),
            Err(RecvTimeoutError::Disconnected) => Err(self.disconnected()),
        }
    }

    pub fn set_option(&self, name: &str, value: &str) -> Result<()> {
        self.write_line(&format!("setoption name {name} value {value}"))
    }

    pub fn isready(&self) -> Result<()> {
        self.write_line("isready")?;
        loop {
            let line = self.recv_line(READY_TIMEOUT)?;
            if line.trim().eq_ignore_ascii_case("readyok") {
                return Ok(());
            }
        }
    }

    pub fn new_game(&self) -> Result<()> {
        self.write_line("ucinewgame")?;
        self.isready()
    }

    fn position_command(fen: Option<&str>, moves: &[String]) -> String {
        let mut cmd = match fen {
            Some(fen) => format!("position fen {fen}"),
            None => String::from("position startpos"),
        };
        if !moves.is_empty() {
            cmd.push_str(" moves ");
            cmd.push_str(&moves.join(" "));
        }
        cmd
    }

    /// Ask the engine for a move in the given position.
    ///
    /// Blocks until `bestmove` arrives or `cancel` is signalled. On
    /// cancellation the search is stopped, the pending `bestmove` is
    /// drained and discarded, and `Ok(None)` is returned; a cancelled call
    /// never produces a result.
    pub fn play(
        &self,
        fen: Option<&str>,
        moves: &[String],
        limit: &Limit,
        cancel: &Receiver<()>,
    ) -> Result<Option<PlayOutcome>> {
        self.write_line(&Self::position_command(fen, moves))?;
        self.write_line(&format!("go {}", limit.go_string()))?;

        let mut record = MoveRecord::default();
        loop {
            select! {
                recv(self.lines) -> line => {
                    let line = line.map_err(|_| self.disconnected())?;
                    let line = line.trim();
                    if line.starts_with("info") {
                        parse_info_line(line, &mut record, &mut None);
                    } else if line.starts_with("bestmove") {
                        let token = line.split_whitespace().nth(1).unwrap_or("");
                        if token.is_empty() || token == "(none)" || token == "resign" {
                            return Ok(Some(PlayOutcome::Resigned));
                        }
                        record.uci = token.to_string();
                        return Ok(Some(PlayOutcome::Move(record)));
                    }
                }
                recv(cancel) -> _ => {
                    trace!("{}: search cancelled", self.name);
                    self.write_line("stop")?;
                    self.drain_to_bestmove();
                    return Ok(None);
                }
            }
        }
    }

    /// Start a multipv analysis of the given position. The returned handle
    /// owns a consumer thread that keeps the line snapshot current until
    /// `stop()` is called or a limited search finishes on its own.
    pub fn analyse(
        &self,
        fen: Option<&str>,
        moves: &[String],
        multipv: u32,
        limit: &Limit,
    ) -> Result<AnalysisHandle> {
        self.set_option("MultiPV", &multipv.to_string())?;
        self.isready()?;
        self.write_line(&Self::position_command(fen, moves))?;
        self.write_line(&format!("go {}", limit.go_string()))?;

        let lines = Arc::new(Mutex::new(vec![AnalysisLine::default(); multipv as usize]));
        let consumer = thread::spawn({
            let rx = self.lines.clone();
            let lines = Arc::clone(&lines);
            let name = self.name.clone();
            move || {
                while let Ok(line) = rx.recv() {
                    let line = line.trim().to_string();
                    if line.starts_with("bestmove") {
                        trace!("{name}: analysis finished");
                        return;
                    }
                    if line.starts_with("info") {
                        let mut record = MoveRecord::default();
                        let mut parsed = Some(AnalysisLine::default());
                        parse_info_line(&line, &mut record, &mut parsed);
                        let parsed = parsed.unwrap();
                        if !parsed.pv.is_empty() {
                            let idx = parsed.multipv.max(1) as usize - 1;
                            let mut lines = lines.lock().unwrap();
                            if idx < lines.len() {
                                lines[idx] = parsed;
                            }
                        }
                    }
                }
            }
        });

        Ok(AnalysisHandle {
            engine_name: self.name.clone(),
            lines,
            stdin: Some(Arc::clone(&self.stdin)),
            consumer: Some(consumer),
        })
    }

    fn drain_to_bestmove(&self) {
        loop {
            match self.lines.recv_timeout(BESTMOVE_GRACE) {
                Ok(line) if line.trim().starts_with("bestmove") => return,
                Ok(_) => {}
                Err(_) => {
                    warn!("{}: no bestmove after stop", self.name);
                    return;
                }
            }
        }
    }

    /// Quit the engine, waiting a bounded time before killing the process.
    pub fn shutdown(&mut self) -> Result<()> {
        let _ = self.write_line("quit");
        match self
            .child
            .wait_timeout(QUIT_GRACE)
            .map_err(|e| self.proc_err(e))?
        {
            Some(status) => trace!("{} exited with {status}", self.name),
            None => {
                warn!("{} did not quit, killing it", self.name);
                self.child.kill().map_err(|e| self.proc_err(e))?;
                self.child.wait().map_err(|e| self.proc_err(e))?;
            }
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if matches!(self.child.try_wait(), Ok(None)) {
            let _ = self.write_line("quit");
            let _ = self.child.wait_timeout(QUIT_GRACE);
            let _ = self.child.kill();
        }
    }
}

/// Parse a UCI `info` line into search stats and, when requested, a
/// multipv analysis line.
fn parse_info_line(line: &str, record: &mut MoveRecord, analysis: &mut Option<AnalysisLine>) {
    let mut it = line.split_whitespace().skip(1);
    while let Some(tok) = it.next() {
        match tok {
            "string" => break,
            "depth" => {
                if let Some(value) = it.next().and_then(|v| v.parse::<u32>().ok()) {
                    record.depth = value;
                    if let Some(a) = analysis {
                        a.depth = value;
                    }
                }
            }
            "seldepth" => {
                if let Some(value) = it.next().and_then(|v| v.parse::<u32>().ok()) {
                    record.seldepth = value;
                }
            }
            "multipv" => {
                if let Some(value) = it.next().and_then(|v| v.parse::<u32>().ok()) {
                    if let Some(a) = analysis {
                        a.multipv = value;
                    }
                }
            }
            "nodes" => {
                if let Some(value) = it.next().and_then(|v| v.parse::<u64>().ok()) {
                    record.nodes = value;
                    if let Some(a) = analysis {
                        a.nodes = value;
                    }
                }
            }
            "nps" => {
                if let Some(value) = it.next().and_then(|v| v.parse::<u64>().ok()) {
                    record.nps = value;
                    if let Some(a) = analysis {
                        a.nps = value;
                    }
                }
            }
            "time" => {
                if let Some(value) = it.next().and_then(|v| v.parse::<u64>().ok()) {
                    record.engine_time = value;
                }
            }
            "hashfull" => {
                if let Some(value) = it.next().and_then(|v| v.parse::<u32>().ok()) {
                    record.hashfull = value;
                }
            }
            "score" => {
                let score = match it.next() {
                    Some("cp") => it.next().and_then(|v| v.parse::<i32>().ok()).map(Score::Cp),
                    Some("mate") => it
                        .next()
                        .and_then(|v| v.parse::<i32>().ok())
                        .map(Score::Mate),
                    _ => None,
                };
                if let Some(score) = score {
                    record.score = score;
                    if let Some(a) = analysis {
                        a.score = score;
                    }
                }
            }
            "pv" => {
                if let Some(a) = analysis {
                    a.pv = it.map(String::from).collect();
                }
                break;
            }
            _ => {}
        }
    }
}

/// Handle to a running (or stopped) analysis. Stopping is idempotent and
/// releases the engine for other requests.
#[derive(Debug)]
pub struct AnalysisHandle {
    engine_name: String,
    lines: Arc<Mutex<Vec<AnalysisLine>>>,
    stdin: Option<Arc<Mutex<ChildStdin>>>,
    consumer: Option<JoinHandle<()>>,
}

impl AnalysisHandle {
    pub fn engine_name(&self) -> &str {
        &self.engine_name
    }

    /// Snapshot of the current candidate lines, best first.
    pub fn lines(&self) -> Vec<AnalysisLine> {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .filter(|l| !l.pv.is_empty())
            .cloned()
            .collect()
    }

    pub fn is_stopped(&self) -> bool {
        self.consumer.is_none()
    }

    /// Stop the search and wait for the consumer thread to see `bestmove`.
    pub fn stop(&mut self) {
        let Some(consumer) = self.consumer.take() else {
            return;
        };
        if let Some(stdin) = self.stdin.take() {
            let mut stdin = stdin.lock().unwrap();
            if writeln!(stdin, "stop").and_then(|_| stdin.flush()).is_err() {
                warn!("{}: could not stop analysis", self.engine_name);
            }
        }
        let _ = consumer.join();
    }

    #[cfg(test)]
    pub(crate) fn detached(engine_name: &str) -> AnalysisHandle {
        AnalysisHandle {
            engine_name: engine_name.to_string(),
            lines: Arc::new(Mutex::new(vec![])),
            stdin: None,
            consumer: None,
        }
    }
}

impl Drop for AnalysisHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn go_string_from_limits() {
        assert_eq!(Limit::default().go_string(), "infinite");
        assert_eq!(
            Limit::movetime(Duration::from_millis(1500)).go_string(),
            "movetime 1500"
        );
        let limit = Limit {
            depth: Some(12),
            nodes: Some(100_000),
            ..Limit::default()
        };
        assert_eq!(limit.go_string(), "depth 12 nodes 100000");
        let limit = Limit {
            clocks: Some(GoClocks {
                wtime: Duration::from_secs(60),
                btime: Duration::from_secs(45),
                winc: Duration::from_secs(1),
                binc: Duration::from_secs(2),
            }),
            ..Limit::default()
        };
        assert_eq!(
            limit.go_string(),
            "wtime 60000 btime 45000 winc 1000 binc 2000"
        );
    }

    #[test]
    fn parse_bestmove_stats() {
        let mut record = MoveRecord::default();
        parse_info_line(
            "info depth 20 seldepth 28 nodes 123456 nps 1000000 time 2000 \
             hashfull 512 score cp 34",
            &mut record,
            &mut None,
        );
        assert_eq!(record.depth, 20);
        assert_eq!(record.seldepth, 28);
        assert_eq!(record.nodes, 123456);
        assert_eq!(record.nps, 1000000);
        assert_eq!(record.engine_time, 2000);
        assert_eq!(record.hashfull, 512);
        assert_eq!(record.score, Score::Cp(34));
    }

    #[test]
    fn parse_multipv_line() {
        let mut record = MoveRecord::default();
        let mut analysis = Some(AnalysisLine::default());
        parse_info_line(
            "info depth 15 multipv 2 score mate -3 nodes 999 pv e2e4 e7e5 g1f3",
            &mut record,
            &mut analysis,
        );
        let line = analysis.unwrap();
        assert_eq!(line.multipv, 2);
        assert_eq!(line.depth, 15);
        assert_eq!(line.score, Score::Mate(-3));
        assert_eq!(line.pv, vec!["e2e4", "e7e5", "g1f3"]);
    }

    #[test]
    fn position_commands() {
        assert_eq!(Engine::position_command(None, &[]), "position startpos");
        assert_eq!(
            Engine::position_command(None, &["e2e4".into(), "e7e5".into()]),
            "position startpos moves e2e4 e7e5"
        );
        assert_eq!(
            Engine::position_command(Some("8/8/8/8/8/8/8/K1k5 w - - 0 1"), &[]),
            "position fen 8/8/8/8/8/8/8/K1k5 w - - 0 1"
        );
    }

    #[test]
    fn info_string_is_ignored() {
        let mut record = MoveRecord::default();
        parse_info_line(
            "info string NNUE evaluation using nn.bin depth 99",
            &mut record,
            &mut None,
        );
        assert_eq!(record.depth, 0);
    }
}
