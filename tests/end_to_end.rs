use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use obsnet::core::state::{BOP_EXPOSURE, BOP_MASK, BOP_TEL_MOVE};
use obsnet::core::PeerConfig;
use obsnet::daemon::{Device, DeviceContext};
use obsnet::network::{Address, Host};
use obsnet::protocol::{Command, Params, Reply, ReplyCode};
use obsnet::time::{Event, EventKind};
use obsnet::{Block, ConnId, Config, Daemon, DeviceType, Error, Result};
use tokio::time::Instant;

const EXPOSURE: Duration = Duration::from_millis(300);

#[derive(Default)]
struct FakeCamera {
    exposures: u32,
}

impl Device for FakeCamera {
    fn device_type(&self) -> DeviceType {
        DeviceType::Ccd
    }

    fn command(
        &mut self,
        ctx: &mut DeviceContext<'_>,
        _conn: ConnId,
        verb: &str,
        params: &mut Params,
    ) -> Result<Reply> {
        match verb {
            "expose" => {
                params.expect_end()?;
                self.exposures += 1;
                ctx.mask_state(BOP_MASK, BOP_EXPOSURE, Some("exposing"));
                ctx.add_timer(EXPOSURE, Event::new(EventKind::ExposureEnd));
                Ok(Reply::Ok)
            }
            _ => Err(Error::command(format!("Unknown command {}", verb))),
        }
    }

    fn event(&mut self, ctx: &mut DeviceContext<'_>, event: &Event) {
        if event.kind == EventKind::ExposureEnd {
            ctx.mask_state(BOP_MASK, 0, None);
        }
    }
}

#[derive(Default)]
struct FakeMount {
    moves: u32,
}

impl Device for FakeMount {
    fn device_type(&self) -> DeviceType {
        DeviceType::Mount
    }

    fn command(
        &mut self,
        _ctx: &mut DeviceContext<'_>,
        _conn: ConnId,
        verb: &str,
        _params: &mut Params,
    ) -> Result<Reply> {
        match verb {
            "move" => {
                self.moves += 1;
                Ok(Reply::Ok)
            }
            _ => Err(Error::command(format!("Unknown command {}", verb))),
        }
    }
}

/// Client process opening connections to every advertised peer
#[derive(Default)]
struct Client {
    bop_changes: Vec<u32>,
    returned: Vec<(String, ReplyCode)>,
}

impl Host for Client {
    fn will_connect(&mut self, _address: &Address) -> bool {
        true
    }

    fn bop_state_changed(&mut self, _block: &mut Block, state: u32) {
        self.bop_changes.push(state);
    }

    fn command_returned(&mut self, _block: &mut Block, _conn: ConnId, command: &Command, code: ReplyCode) {
        self.returned.push((command.text.clone(), code));
    }
}

struct Network {
    camera: Block,
    camera_daemon: Daemon<FakeCamera>,
    mount: Block,
    mount_daemon: Daemon<FakeMount>,
    client: Block,
    client_host: Client,
}

fn config(name: &str, device_type: DeviceType) -> Config {
    let mut config = Config::new(name);
    config.device_type = device_type;
    config.listen_addr = IpAddr::V4(Ipv4Addr::LOCALHOST);
    config.idle_timeout = Duration::from_millis(10);
    config
}

fn peer(name: &str, block: &Block, device_type: DeviceType) -> PeerConfig {
    PeerConfig {
        name: name.to_string(),
        host: "127.0.0.1".to_string(),
        port: block.local_addr().map(|addr| addr.port()).unwrap_or(0),
        device_type,
        centrald_num: 0,
    }
}

impl Network {
    async fn start() -> Result<Self> {
        let camera = Block::bind(config("C0", DeviceType::Ccd)).await?;
        let mount = Block::bind(config("T0", DeviceType::Mount)).await?;

        let mut client_config = config("EXEC", DeviceType::Exec);
        client_config.peers = vec![
            peer("C0", &camera, DeviceType::Ccd),
            peer("T0", &mount, DeviceType::Mount),
        ];
        let client = Block::bind(client_config).await?;

        Ok(Network {
            camera,
            camera_daemon: Daemon::new(FakeCamera::default())?,
            mount,
            mount_daemon: Daemon::new(FakeMount::default())?,
            client,
            client_host: Client::default(),
        })
    }

    async fn pass(&mut self) -> Result<()> {
        self.client.one_run_loop(&mut self.client_host).await?;
        self.camera.one_run_loop(&mut self.camera_daemon).await?;
        self.mount.one_run_loop(&mut self.mount_daemon).await?;
        Ok(())
    }

    /// Pumps all three blocks until `done` holds; false on timeout
    async fn until<F>(&mut self, done: F) -> bool
    where
        F: Fn(&Network) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done(self) {
                return true;
            }
            if self.pass().await.is_err() {
                return false;
            }
        }
        done(self)
    }

    fn ready(&self, id: ConnId) -> bool {
        self.client
            .connection(id)
            .map(|conn| conn.state().is_authenticated())
            .unwrap_or(false)
    }
}

#[tokio::test]
async fn test_expose_blocks_second_exposure_but_not_move() {
    let mut net = tokio_test::assert_ok!(Network::start().await);

    let camera = tokio_test::assert_ok!(net
        .client
        .get_or_open_connection(&mut net.client_host, "C0"));
    let mount = tokio_test::assert_ok!(net
        .client
        .get_or_open_connection(&mut net.client_host, "T0"));
    assert_eq!(
        net.client.get_or_open_connection(&mut net.client_host, "C0").ok(),
        Some(camera)
    );
    assert!(net
        .client
        .get_or_open_connection(&mut net.client_host, "D0")
        .is_err());

    assert!(net.until(|net| net.ready(camera) && net.ready(mount)).await);
    assert_eq!(
        net.client.connection(camera).map(|conn| conn.device_type()),
        Some(DeviceType::Ccd)
    );

    net.client
        .queue_command(camera, Command::with_bop("expose", BOP_EXPOSURE))
        .unwrap();
    assert!(net.until(|net| net.client.full_bop() & BOP_EXPOSURE != 0).await);
    assert_eq!(net.camera_daemon.device().exposures, 1);
    assert!(net.client_host.bop_changes.contains(&BOP_EXPOSURE));

    // the camera is busy: a second exposure waits on the client side, the
    // move goes out to the mount at once
    net.client
        .queue_command(camera, Command::with_bop("expose", BOP_EXPOSURE))
        .unwrap();
    net.client.que_all(Command::with_bop("move", BOP_TEL_MOVE));

    assert!(net.until(|net| net.mount_daemon.device().moves == 1).await);
    assert_eq!(net.camera_daemon.device().exposures, 1);
    assert!(!net.client.command_queue_empty());
    assert!(net.client.full_bop() & BOP_EXPOSURE != 0);

    // exposure end clears the bit and releases the queued exposure
    assert!(net.until(|net| net.camera_daemon.device().exposures == 2).await);
    assert!(net.client_host.bop_changes.contains(&0));
    assert!(net.until(|net| net.client.command_queue_empty()).await);
    assert_eq!(
        net.client_host
            .returned
            .iter()
            .filter(|(text, code)| text == "expose" && *code == ReplyCode::Ok)
            .count(),
        2
    );
    assert!(net
        .client_host
        .returned
        .contains(&("move".to_string(), ReplyCode::Ok)));
    // the camera got its copy of the move only after the second exposure
    assert!(net
        .client_host
        .returned
        .contains(&("move".to_string(), ReplyCode::Command)));
}

#[tokio::test]
async fn test_commands_replied_and_broken_peer_detected() {
    let mut net = tokio_test::assert_ok!(Network::start().await);
    let camera = net
        .client
        .get_or_open_connection(&mut net.client_host, "C0")
        .unwrap();
    assert!(net.until(|net| net.ready(camera)).await);

    net.client.queue_command(camera, Command::new("info")).unwrap();
    net.client
        .queue_command(camera, Command::new("focus 10"))
        .unwrap();
    assert!(net.until(|net| net.client_host.returned.len() == 2).await);
    assert_eq!(
        net.client_host.returned,
        vec![
            ("info".to_string(), ReplyCode::Ok),
            ("focus 10".to_string(), ReplyCode::Command),
        ]
    );

    // the camera process goes away, the client keeps its connection as broken
    let stopped = std::mem::replace(&mut net.camera, Block::new(config("C0", DeviceType::Ccd)));
    drop(stopped);
    assert!(net
        .until(|net| net.client.connection(camera).map(|conn| conn.state().is_live()) == Some(false))
        .await);
}
