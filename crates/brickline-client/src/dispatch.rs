//! Dispatcher task.
//!
//! Sole owner of the callback registries: per-(UID, function ID) device
//! callbacks, the enumerate list and the connect/disconnect lifecycle lists.
//! Lifecycle events are delivered inline in registration order; device and
//! enumerate callbacks are each invoked on their own spawned task so a slow
//! handler cannot stall dispatch.
//!
//! Registration IDs come from one counter shared by every registry kind, so
//! an ID identifies its registration unambiguously. Deregistering an unknown
//! ID is a silent no-op.

use std::{collections::HashMap, sync::Arc};

use brickline_proto::{PacketBuf, PacketHeader, function_id};
use tokio::sync::{mpsc, oneshot};

use crate::{
    connection::{ConnectReason, DisconnectReason},
    socket::LifecycleEvent,
};

/// Handler for a device or enumerate callback packet.
pub(crate) type PacketCallback = Arc<dyn Fn(PacketBuf) + Send + Sync>;

/// Handler for the connect lifecycle event.
pub(crate) type ConnectCallback = Arc<dyn Fn(ConnectReason) + Send + Sync>;

/// Handler for the disconnect lifecycle event.
pub(crate) type DisconnectCallback = Arc<dyn Fn(DisconnectReason) + Send + Sync>;

/// Registration and deregistration requests for all registry kinds.
pub(crate) enum RegistryCommand {
    /// Register a handler for callback packets of one device function.
    RegisterCallback {
        uid: u32,
        function_id: u8,
        callback: PacketCallback,
        reg_id_tx: oneshot::Sender<u64>,
    },
    /// Remove a device callback registration.
    DeregisterCallback { uid: u32, function_id: u8, reg_id: u64 },
    /// Register a connect lifecycle handler.
    RegisterConnect { callback: ConnectCallback, reg_id_tx: oneshot::Sender<u64> },
    /// Register a disconnect lifecycle handler.
    RegisterDisconnect { callback: DisconnectCallback, reg_id_tx: oneshot::Sender<u64> },
    /// Register a handler for enumerate callbacks.
    RegisterEnumerate { callback: PacketCallback, reg_id_tx: oneshot::Sender<u64> },
    /// Remove a connect, disconnect or enumerate registration.
    DeregisterLifecycle { reg_id: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CallbackKey {
    uid: u32,
    function_id: u8,
}

/// The registries themselves, separate from the task loop so registration
/// bookkeeping stays directly testable.
#[derive(Default)]
struct Registries {
    next_reg_id: u64,
    device: HashMap<CallbackKey, Vec<(u64, PacketCallback)>>,
    connect: Vec<(u64, ConnectCallback)>,
    disconnect: Vec<(u64, DisconnectCallback)>,
    enumerate: Vec<(u64, PacketCallback)>,
}

impl Registries {
    fn apply(&mut self, command: RegistryCommand) {
        match command {
            RegistryCommand::RegisterCallback { uid, function_id, callback, reg_id_tx } => {
                let reg_id = self.fresh_reg_id();
                self.device
                    .entry(CallbackKey { uid, function_id })
                    .or_default()
                    .push((reg_id, callback));
                let _ = reg_id_tx.send(reg_id);
            }
            RegistryCommand::DeregisterCallback { uid, function_id, reg_id } => {
                if let Some(list) = self.device.get_mut(&CallbackKey { uid, function_id })
                    && let Some(index) = list.iter().position(|(id, _)| *id == reg_id)
                {
                    list.swap_remove(index);
                }
            }
            RegistryCommand::RegisterConnect { callback, reg_id_tx } => {
                let reg_id = self.fresh_reg_id();
                self.connect.push((reg_id, callback));
                let _ = reg_id_tx.send(reg_id);
            }
            RegistryCommand::RegisterDisconnect { callback, reg_id_tx } => {
                let reg_id = self.fresh_reg_id();
                self.disconnect.push((reg_id, callback));
                let _ = reg_id_tx.send(reg_id);
            }
            RegistryCommand::RegisterEnumerate { callback, reg_id_tx } => {
                let reg_id = self.fresh_reg_id();
                self.enumerate.push((reg_id, callback));
                let _ = reg_id_tx.send(reg_id);
            }
            RegistryCommand::DeregisterLifecycle { reg_id } => {
                if let Some(index) = self.connect.iter().position(|(id, _)| *id == reg_id) {
                    self.connect.swap_remove(index);
                } else if let Some(index) =
                    self.disconnect.iter().position(|(id, _)| *id == reg_id)
                {
                    self.disconnect.swap_remove(index);
                } else if let Some(index) =
                    self.enumerate.iter().position(|(id, _)| *id == reg_id)
                {
                    self.enumerate.swap_remove(index);
                }
            }
        }
    }

    fn fresh_reg_id(&mut self) -> u64 {
        let reg_id = self.next_reg_id;
        self.next_reg_id += 1;
        reg_id
    }

    /// Deliver a lifecycle event to every handler, in registration order.
    fn dispatch_lifecycle(&self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Connected(reason) => {
                for (_, callback) in &self.connect {
                    callback(reason);
                }
            }
            LifecycleEvent::Disconnected(reason) => {
                for (_, callback) in &self.disconnect {
                    callback(reason);
                }
            }
        }
    }

    /// Fan a callback packet out to its handlers, one spawned task each.
    fn dispatch_packet(&self, packet: PacketBuf) {
        let header = PacketHeader::from_packet(&packet);
        if header.function_id == function_id::CALLBACK_ENUMERATE {
            for (_, callback) in &self.enumerate {
                spawn_delivery(callback, packet);
            }
        } else {
            let key = CallbackKey { uid: header.uid, function_id: header.function_id };
            let Some(list) = self.device.get(&key) else {
                tracing::trace!(
                    uid = header.uid,
                    function_id = header.function_id,
                    "dropping callback nobody registered for"
                );
                return;
            };
            for (_, callback) in list {
                spawn_delivery(callback, packet);
            }
        }
    }
}

fn spawn_delivery(callback: &PacketCallback, packet: PacketBuf) {
    let callback = Arc::clone(callback);
    tokio::spawn(async move { callback(packet) });
}

/// Channel ends owned by the dispatcher task.
pub(crate) struct DispatcherTask {
    pub terminate_rx: mpsc::Receiver<()>,
    pub event_rx: mpsc::Receiver<LifecycleEvent>,
    pub callback_rx: mpsc::Receiver<PacketBuf>,
    pub command_rx: mpsc::Receiver<RegistryCommand>,
}

impl DispatcherTask {
    /// Serve registrations and fan out events until terminated.
    pub(crate) async fn run(mut self) {
        let mut registries = Registries::default();

        loop {
            tokio::select! {
                _ = self.terminate_rx.recv() => return,
                Some(event) = self.event_rx.recv() => {
                    registries.dispatch_lifecycle(event);
                }
                Some(packet) = self.callback_rx.recv() => {
                    registries.dispatch_packet(packet);
                }
                Some(command) = self.command_rx.recv() => {
                    registries.apply(command);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use brickline_proto::MAX_PACKET_SIZE;

    use super::*;

    fn noop_packet_callback() -> PacketCallback {
        Arc::new(|_| {})
    }

    fn register_device(registries: &mut Registries, uid: u32, function_id: u8) -> u64 {
        let (reg_id_tx, mut reg_id_rx) = oneshot::channel();
        registries.apply(RegistryCommand::RegisterCallback {
            uid,
            function_id,
            callback: noop_packet_callback(),
            reg_id_tx,
        });
        reg_id_rx.try_recv().unwrap()
    }

    #[test]
    fn reg_ids_are_unique_across_registry_kinds() {
        let mut registries = Registries::default();

        let first = register_device(&mut registries, 7, 9);

        let (reg_id_tx, mut reg_id_rx) = oneshot::channel();
        registries.apply(RegistryCommand::RegisterConnect {
            callback: Arc::new(|_| {}),
            reg_id_tx,
        });
        let second = reg_id_rx.try_recv().unwrap();

        let (reg_id_tx, mut reg_id_rx) = oneshot::channel();
        registries.apply(RegistryCommand::RegisterEnumerate {
            callback: noop_packet_callback(),
            reg_id_tx,
        });
        let third = reg_id_rx.try_recv().unwrap();

        assert!(first < second && second < third);
    }

    #[test]
    fn deregister_unknown_id_is_a_no_op() {
        let mut registries = Registries::default();
        register_device(&mut registries, 7, 9);

        registries.apply(RegistryCommand::DeregisterCallback {
            uid: 7,
            function_id: 9,
            reg_id: 4242,
        });
        registries.apply(RegistryCommand::DeregisterLifecycle { reg_id: 4242 });

        assert_eq!(registries.device[&CallbackKey { uid: 7, function_id: 9 }].len(), 1);
    }

    #[test]
    fn deregister_removes_only_the_matching_registration() {
        let mut registries = Registries::default();
        let first = register_device(&mut registries, 7, 9);
        let second = register_device(&mut registries, 7, 9);

        registries.apply(RegistryCommand::DeregisterCallback {
            uid: 7,
            function_id: 9,
            reg_id: first,
        });

        let remaining = &registries.device[&CallbackKey { uid: 7, function_id: 9 }];
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].0, second);
    }

    #[test]
    fn lifecycle_handlers_run_in_registration_order() {
        let mut registries = Registries::default();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in [1, 2, 3] {
            let order = Arc::clone(&order);
            let (reg_id_tx, _reg_id_rx) = oneshot::channel();
            registries.apply(RegistryCommand::RegisterConnect {
                callback: Arc::new(move |_| order.lock().unwrap().push(tag)),
                reg_id_tx,
            });
        }

        registries.dispatch_lifecycle(LifecycleEvent::Connected(ConnectReason::Request));
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn enumerate_packets_reach_enumerate_handlers() {
        let mut registries = Registries::default();
        let (seen_tx, mut seen_rx) = mpsc::channel(1);
        let (reg_id_tx, _reg_id_rx) = oneshot::channel();
        registries.apply(RegistryCommand::RegisterEnumerate {
            callback: Arc::new(move |packet: PacketBuf| {
                let _ = seen_tx.try_send(packet[5]);
            }),
            reg_id_tx,
        });

        let mut packet = [0u8; MAX_PACKET_SIZE];
        packet[4] = 8;
        packet[5] = function_id::CALLBACK_ENUMERATE;
        registries.dispatch_packet(packet);

        assert_eq!(seen_rx.recv().await, Some(function_id::CALLBACK_ENUMERATE));
    }
}
