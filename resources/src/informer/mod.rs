use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Result;
use futures_util::future::BoxFuture;
use reflector::{Reflector, ReflectorNotification};
use tokio::{
    net::TcpStream,
    select,
    sync::{mpsc, RwLock},
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::objects::Object;

mod reflector;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub type Store<T> = Arc<RwLock<HashMap<String, T>>>;

pub type CLS<ARG, RES> = Box<dyn Fn(ARG) -> BoxFuture<'static, Result<RES>> + Send + Sync>;

/// How often the resync handler is invoked against the full store.
const RESYNC_PERIOD: Duration = Duration::from_secs(30);

pub struct ListerWatcher<T> {
    pub lister: CLS<(), Vec<T>>,
    pub watcher: CLS<(), WsStream>,
}

pub struct EventHandler<T> {
    pub add_cls: CLS<T, ()>,
    pub update_cls: CLS<(T, T), ()>,
    pub delete_cls: CLS<T, ()>,
}

pub struct ResyncHandler(pub CLS<(), ()>);

pub struct Informer<T> {
    reflector: Arc<Reflector<T>>,
    eh: EventHandler<T>,
    rh: ResyncHandler,
}

impl<T: Object> Informer<T> {
    pub fn new(lw: ListerWatcher<T>, eh: EventHandler<T>, rh: ResyncHandler) -> Self {
        let reflector = Reflector {
            lw,
            store: Arc::new(RwLock::new(HashMap::new())),
        };
        Self {
            reflector: Arc::new(reflector),
            eh,
            rh,
        }
    }

    pub fn get_store(&self) -> Store<T> {
        self.reflector.store.clone()
    }

    pub async fn run(&self) -> Result<()> {
        // start reflector
        let (tx, mut rx) = mpsc::channel::<ReflectorNotification<T>>(16);
        let r = self.reflector.clone();
        let reflector_handle = tokio::spawn(async move { r.run(tx).await });

        let mut ticker = tokio::time::interval(RESYNC_PERIOD);
        // the first tick fires immediately, before the store is filled
        ticker.tick().await;

        loop {
            select! {
                notification = rx.recv() => {
                    match notification {
                        Some(ReflectorNotification::Add(new)) => {
                            (self.eh.add_cls)(new).await?;
                        },
                        Some(ReflectorNotification::Update(old, new)) => {
                            (self.eh.update_cls)((old, new)).await?;
                        },
                        Some(ReflectorNotification::Delete(old)) => {
                            (self.eh.delete_cls)(old).await?;
                        },
                        // reflector is gone, surface its error
                        None => break,
                    }
                },
                _ = ticker.tick() => {
                    (self.rh.0)(()).await?;
                },
            }
        }

        reflector_handle.await?
    }
}
