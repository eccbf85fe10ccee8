mod common;

mod uart {
    use crate::common;
    use pretty_assertions::assert_eq;
    use snap_pad::platform::Serial;
    use snap_pad::uart::{QueuedSerial, RX_RING_LEN, RxQueue, on_receive};

    #[test]
    fn bytes_arrive_in_order() {
        let mut queue = RxQueue::new();
        let (mut producer, consumer) = queue.split();
        let mut sent = Vec::new();
        let mut serial = QueuedSerial::new(consumer, |b| sent.push(b), common::StdClock::new());

        for byte in [0x10, 0x11, 0x23] {
            assert!(on_receive(&mut producer, byte));
        }
        assert_eq!(serial.pending(), 3);
        assert_eq!(serial.recv(), 0x10);
        assert_eq!(serial.recv_timeout(5), Some(0x11));
        assert_eq!(serial.recv_timeout(5), Some(0x23));
        assert_eq!(serial.recv_timeout(5), None);

        serial.send_buffer(&[1, 2, 3]);
        drop(serial);
        assert_eq!(sent, vec![1, 2, 3]);
    }

    #[test]
    fn overrun_drops_bytes() {
        let mut queue = RxQueue::new();
        let (mut producer, consumer) = queue.split();
        let serial = QueuedSerial::new(consumer, |_| {}, common::StdClock::new());

        // one slot of the ring always stays free
        for i in 0..RX_RING_LEN - 1 {
            assert!(on_receive(&mut producer, i as u8));
        }
        assert!(!on_receive(&mut producer, 0xff));
        assert_eq!(serial.pending(), RX_RING_LEN - 1);
    }
}
