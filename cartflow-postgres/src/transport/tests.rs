use super::*;

use cartflow::serde::json::Json;
use cartflow::serde::Deserializer;
use cartflow::{BatchPublisher, CartEntry, CartUpdateRequest, DEFAULT_TYPE_ID, TYPE_ID_HEADER};

fn laptop_request(user_id: &str, version_number: u64) -> CartUpdateRequest {
    CartUpdateRequest::new(user_id, version_number)
        .with_entry(CartEntry::qty_change("P001", "Laptop", 1))
}

fn sample_batch() -> Vec<CartUpdateRequest> {
    (1..=4)
        .flat_map(|user| (1..=2).map(move |version| laptop_request(&format!("user_{user}"), version)))
        .collect()
}

async fn transport(pool: PgPool) -> PgTransport {
    PgTransport::try_new(pool, PgTransportConfig::topic("cart-update-request").with_partitions(2))
        .await
        .unwrap()
}

#[sqlx::test]
async fn it_delivers_each_user_in_version_order(pool: PgPool) {
    let transport = transport(pool).await;
    let publisher = BatchPublisher::new(transport.clone(), Json::default());

    publisher.publish_batch(&sample_batch()).await.unwrap();

    let json = Json::<CartUpdateRequest>::default();
    let mut delivered = 0;
    for partition in 0..2 {
        let lane = transport.read_lane(partition, 0, 100).await.unwrap();
        let offsets: Vec<u64> = lane.iter().map(|m| m.offset).collect();
        assert_eq!(offsets, (0..lane.len() as u64).collect::<Vec<_>>());
        for message in &lane {
            assert_eq!(transport.partition_of(&message.envelope.key), partition);
        }
        delivered += lane.len();
    }
    assert_eq!(delivered, 8);

    for user in ["user_1", "user_2", "user_3", "user_4"] {
        let lane = transport
            .read_lane(transport.partition_of(user.as_bytes()), 0, 100)
            .await
            .unwrap();
        let versions: Vec<u64> = lane
            .iter()
            .filter(|m| m.envelope.key == user.as_bytes())
            .map(|m| json.deserialize(&m.envelope.value).unwrap().version_number)
            .collect();
        assert_eq!(versions, vec![1, 2], "user {user}");
    }
}

#[sqlx::test]
async fn it_keeps_headers(pool: PgPool) {
    let transport = transport(pool).await;
    let envelope = Envelope::new("user_1", b"{}".to_vec())
        .with_header(TYPE_ID_HEADER, DEFAULT_TYPE_ID)
        .with_header("trace", vec![0u8, 1, 2]);

    transport.write_messages(vec![envelope.clone()]).await.unwrap();

    let lane = transport
        .read_lane(transport.partition_of(b"user_1"), 0, 10)
        .await
        .unwrap();
    assert_eq!(lane.len(), 1);
    assert_eq!(lane[0].envelope, envelope);
    assert_eq!(lane[0].envelope.type_id(), Some(DEFAULT_TYPE_ID));
}

#[sqlx::test]
async fn it_continues_offsets_across_batches(pool: PgPool) {
    let transport = transport(pool).await;
    let partition = transport.partition_of(b"user_1");

    for version in 1..=3 {
        let envelope = Envelope::new("user_1", version.to_string());
        transport.write_messages(vec![envelope]).await.unwrap();
    }

    let lane = transport.read_lane(partition, 1, 10).await.unwrap();
    let offsets: Vec<u64> = lane.iter().map(|m| m.offset).collect();
    let values: Vec<&[u8]> = lane.iter().map(|m| m.envelope.value.as_slice()).collect();
    assert_eq!(offsets, vec![1, 2]);
    assert_eq!(values, vec![b"2".as_slice(), b"3".as_slice()]);
}

#[sqlx::test]
async fn it_separates_topics(pool: PgPool) {
    let orders = PgTransport::try_new(pool.clone(), PgTransportConfig::topic("orders"))
        .await
        .unwrap();
    let carts = PgTransport::try_new(pool, PgTransportConfig::topic("carts"))
        .await
        .unwrap();

    orders
        .write_messages(vec![Envelope::new("user_1", "order")])
        .await
        .unwrap();

    assert!(carts.read_lane(0, 0, 10).await.unwrap().is_empty());
    assert_eq!(orders.read_lane(0, 0, 10).await.unwrap().len(), 1);
}

#[sqlx::test]
async fn it_rejects_topics_without_partitions(pool: PgPool) {
    let result =
        PgTransport::try_new(pool, PgTransportConfig::topic("carts").with_partitions(0)).await;

    assert!(matches!(result, Err(Error::InvalidPartitions(0))));
}

#[sqlx::test]
async fn it_rejects_reads_outside_the_topic(pool: PgPool) {
    let transport = transport(pool).await;

    let result = transport.read_lane(2, 0, 10).await;

    assert!(matches!(
        result,
        Err(Error::PartitionOutOfRange {
            partition: 2,
            partitions: 2
        })
    ));
}
