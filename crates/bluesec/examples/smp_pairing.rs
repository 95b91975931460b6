//! Example demonstrating SMP pairing between two devices
//!
//! Both the central and the peripheral run in this process. PDUs and link
//! encryption requests travel over an in-memory queue standing in for the
//! L2CAP fixed channel and the controllers.

use bluesec::smp::{LongTermKey, UserRequest};
use bluesec::*;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Write};
use std::rc::Rc;

const HANDLE: u16 = 0x0040;

enum Message {
    Pdu(Vec<u8>),
    Encrypt(LongTermKey),
    LtkReply(Option<[u8; 16]>),
}

type Wire = Rc<RefCell<VecDeque<(usize, Message)>>>;

struct Channel {
    side: usize,
    wire: Wire,
}

impl SmpTransport for Channel {
    fn send_pdu(&mut self, _handle: u16, pdu: &[u8]) -> Result<(), TransportError> {
        self.wire
            .borrow_mut()
            .push_back((self.side, Message::Pdu(pdu.to_vec())));
        Ok(())
    }
}

impl LinkLayer for Channel {
    fn start_encryption(&mut self, _handle: u16, ltk: &LongTermKey) -> Result<(), TransportError> {
        self.wire
            .borrow_mut()
            .push_back((self.side, Message::Encrypt(*ltk)));
        Ok(())
    }

    fn ltk_reply(&mut self, _handle: u16, key: &[u8; 16]) -> Result<(), TransportError> {
        self.wire
            .borrow_mut()
            .push_back((self.side, Message::LtkReply(Some(*key))));
        Ok(())
    }

    fn ltk_negative_reply(&mut self, _handle: u16) -> Result<(), TransportError> {
        self.wire
            .borrow_mut()
            .push_back((self.side, Message::LtkReply(None)));
        Ok(())
    }
}

fn ask(question: &str) -> io::Result<bool> {
    print!("{} (y/n): ", question);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let answer = input.trim().to_lowercase();
    Ok(answer == "y" || answer == "yes")
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    println!("SMP Pairing Example");
    println!("-----------------");

    let wire: Wire = Rc::new(RefCell::new(VecDeque::new()));
    let events: Rc<RefCell<Vec<(usize, SmpEvent)>>> = Rc::new(RefCell::new(Vec::new()));

    let config = SecurityConfig {
        io_capability: IoCapability::DisplayYesNo,
        auth_req: AuthRequirements::secure(),
        ..Default::default()
    };

    let mut devices = Vec::new();
    for side in 0..2 {
        let mut manager = SmpManager::new(
            Channel {
                side,
                wire: wire.clone(),
            },
            Channel {
                side,
                wire: wire.clone(),
            },
            SoftwareCrypto::new(),
            BondingStore::open(MemoryTagStore::new(), 8),
        );
        manager.configure(config.clone())?;
        let events = events.clone();
        manager.register_handler(move |event: &SmpEvent| {
            events.borrow_mut().push((side, event.clone()))
        });
        devices.push(manager);
    }

    let central = LeAddress::public([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
    let peripheral = LeAddress::random([0x11, 0x22, 0x33, 0x44, 0x55, 0xC6]);
    devices[0].connection_established(HANDLE, smp::PairingRole::Initiator, central, peripheral);
    devices[1].connection_established(HANDLE, smp::PairingRole::Responder, peripheral, central);

    println!("Central {} pairing with peripheral {}", central, peripheral);
    devices[0].request_pairing(HANDLE)?;

    let mut pending_ltk = None;
    loop {
        let next = wire.borrow_mut().pop_front();
        match next {
            Some((from, Message::Pdu(pdu))) => {
                if let Err(err) = devices[1 - from].handle_smp_packet(HANDLE, &pdu) {
                    eprintln!("SMP error: {}", err);
                }
            }
            Some((_, Message::Encrypt(ltk))) => {
                pending_ltk = Some(ltk.key);
                devices[1].on_ltk_request(HANDLE, ltk.ediv, ltk.rand)?;
            }
            Some((_, Message::LtkReply(key))) => {
                if key.is_some() && key == pending_ltk.take() {
                    devices[1].on_encryption_change(HANDLE, 0, true);
                    devices[0].on_encryption_change(HANDLE, 0, true);
                } else {
                    devices[0].on_encryption_change(HANDLE, 0x06, false);
                }
            }
            None => {}
        }

        let drained: Vec<_> = events.borrow_mut().drain(..).collect();
        for (side, event) in drained {
            let name = if side == 0 { "central" } else { "peripheral" };
            match event {
                SmpEvent::UserRequest {
                    request: UserRequest::NumericComparison(value),
                    ..
                } => {
                    let answer = if ask(&format!("[{}] Does {:06} match on the other device?", name, value))? {
                        devices[side].numeric_comparison_confirm(HANDLE)
                    } else {
                        devices[side].bonding_decline(HANDLE)
                    };
                    if let Err(err) = answer {
                        eprintln!("[{}] {}", name, err);
                    }
                }
                SmpEvent::Pairing(PairingEvent::Complete { result, .. }) => match result {
                    Ok(summary) => println!(
                        "[{}] Pairing succeeded: {} at {:?}, bond slot {:?}",
                        name, summary.method, summary.security_level, summary.bonded_slot
                    ),
                    Err(err) => println!("[{}] Pairing failed: {}", name, err),
                },
                other => println!("[{}] {:?}", name, other),
            }
        }

        if wire.borrow().is_empty() && !devices[0].is_pairing(HANDLE) && !devices[1].is_pairing(HANDLE) {
            break;
        }
    }

    for (slot, bond) in devices[0].bonds() {
        println!("Central bond {}: {} ({:?})", slot, bond.address, bond.security_level());
    }
    Ok(())
}
